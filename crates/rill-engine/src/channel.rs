//! Dataflow channel primitives.
//!
//! Channels are unbounded FIFOs carrying [`Element`]s. `Element::Stop` is the
//! poison pill: once read, no further data will arrive on that channel.
//! A [`InputSource::Value`] is the one-shot broadcast variable, repeating its
//! value on every read and never stopping.

use tokio::sync::mpsc;
use tracing::trace;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Item(Value),
    /// End of stream. Forwarded downstream by operators once all firings
    /// submitted before it have settled.
    Stop,
}

pub fn channel() -> (ChannelWriter, ChannelReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelWriter { tx }, ChannelReader { rx })
}

#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Element>,
}

impl ChannelWriter {
    pub fn send(&self, value: Value) {
        if self.tx.send(Element::Item(value)).is_err() {
            trace!("channel reader dropped before item was delivered");
        }
    }

    /// Emit the poison pill.
    pub fn close(&self) {
        if self.tx.send(Element::Stop).is_err() {
            trace!("channel reader dropped before stop was delivered");
        }
    }
}

#[derive(Debug)]
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Element>,
}

impl ChannelReader {
    /// Next element. A dropped writer reads as `Stop`.
    pub async fn read(&mut self) -> Element {
        self.rx.recv().await.unwrap_or(Element::Stop)
    }
}

/// Where an input parameter takes its values from.
#[derive(Debug)]
pub enum InputSource {
    /// A FIFO channel; participates in poison-pill termination.
    Queue(ChannelReader),
    /// A bound value, repeated for every firing. Never stops.
    Value(Value),
}

impl InputSource {
    pub fn of(value: impl Into<Value>) -> Self {
        InputSource::Value(value.into())
    }

    pub fn is_queue(&self) -> bool {
        matches!(self, InputSource::Queue(_))
    }

    pub async fn read(&mut self) -> Element {
        match self {
            InputSource::Queue(reader) => reader.read().await,
            InputSource::Value(value) => Element::Item(value.clone()),
        }
    }
}
