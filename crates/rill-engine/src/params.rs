//! Input and output parameter declarations.
//!
//! A process declares one `InParam` per inbound channel and one `OutParam`
//! per outbound channel. At operator construction the inbound declarations
//! are split into a [`ParamSpec`] (the kind, kept for per-firing resolution)
//! and an [`InputSource`] (consumed by the tuple driver).

use crate::channel::{ChannelWriter, InputSource};

/// Inbound parameter binding.
#[derive(Debug)]
pub enum InParam {
    /// Bind the value under `name` in the firing context.
    Value { name: String, from: InputSource },
    /// Stage the value as a file (or files) under a name derived from
    /// `pattern`; the context maps `name` to the staged name(s).
    File {
        name: String,
        pattern: String,
        from: InputSource,
    },
    /// Export the value as an environment variable.
    Env { name: String, from: InputSource },
    /// Pipe the value into the command's standard input.
    Stdin { from: InputSource },
    /// Iterate: each firing receives one element of the bound collection,
    /// with the cartesian product taken across all `Each` inputs.
    Each { name: String, from: InputSource },
    /// A tuple of inner bindings carried jointly on one channel.
    Set {
        slots: Vec<SetSlot>,
        from: InputSource,
    },
    /// Resolve once at the first firing and reuse the same value for all
    /// later firings. Forces serial execution. The optional writer is bound
    /// once with the final value after the operator stops.
    SharedValue {
        name: String,
        from: InputSource,
        out: Option<ChannelWriter>,
    },
    /// Shared variant of `File`.
    SharedFile {
        name: String,
        pattern: String,
        from: InputSource,
        out: Option<ChannelWriter>,
    },
}

/// Inner binding of a `Set` tuple.
#[derive(Debug, Clone)]
pub enum SetSlot {
    Value { name: String },
    File { name: String, pattern: String },
}

/// The declaration part of an [`InParam`], without its source.
#[derive(Debug, Clone)]
pub(crate) enum ParamSpec {
    Value {
        name: String,
    },
    File {
        name: String,
        pattern: String,
    },
    Env {
        name: String,
    },
    Stdin,
    Each {
        name: String,
    },
    Set {
        slots: Vec<SetSlot>,
    },
    SharedValue {
        name: String,
        out: Option<ChannelWriter>,
    },
    SharedFile {
        name: String,
        pattern: String,
        out: Option<ChannelWriter>,
    },
}

impl ParamSpec {
    pub(crate) fn is_shared(&self) -> bool {
        matches!(self, ParamSpec::SharedValue { .. } | ParamSpec::SharedFile { .. })
    }

    pub(crate) fn is_each(&self) -> bool {
        matches!(self, ParamSpec::Each { .. })
    }
}

impl InParam {
    pub(crate) fn split(self) -> (ParamSpec, InputSource) {
        match self {
            InParam::Value { name, from } => (ParamSpec::Value { name }, from),
            InParam::File {
                name,
                pattern,
                from,
            } => (ParamSpec::File { name, pattern }, from),
            InParam::Env { name, from } => (ParamSpec::Env { name }, from),
            InParam::Stdin { from } => (ParamSpec::Stdin, from),
            InParam::Each { name, from } => (ParamSpec::Each { name }, from),
            InParam::Set { slots, from } => (ParamSpec::Set { slots }, from),
            InParam::SharedValue { name, from, out } => {
                (ParamSpec::SharedValue { name, out }, from)
            }
            InParam::SharedFile {
                name,
                pattern,
                from,
                out,
            } => (ParamSpec::SharedFile { name, pattern, out }, from),
        }
    }
}

/// Outbound parameter binding. Each holds the write side of a channel.
#[derive(Debug)]
pub enum OutParam {
    /// Emit the context value under `name`.
    Value { name: String, to: ChannelWriter },
    /// Emit the work-directory files matching `pattern`.
    File { pattern: String, to: ChannelWriter },
    /// Emit the captured standard output.
    Stdout { to: ChannelWriter },
    /// Emit a tuple of inner outputs as one list element.
    Set {
        slots: Vec<OutSlot>,
        to: ChannelWriter,
    },
}

#[derive(Debug, Clone)]
pub enum OutSlot {
    Value { name: String },
    File { pattern: String },
    Stdout,
}

impl OutParam {
    pub(crate) fn writer(&self) -> &ChannelWriter {
        match self {
            OutParam::Value { to, .. }
            | OutParam::File { to, .. }
            | OutParam::Stdout { to }
            | OutParam::Set { to, .. } => to,
        }
    }
}
