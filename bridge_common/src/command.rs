//! Tier-1 command payload sent from a remote client to an engine session.
//!
//! A `Command` is pure data: an operation code, positional arguments and an optional map of
//! named arguments, addressed to one session handle. The engine resolves the operation code to
//! its native function by ordinal; the bridge never interprets it, except for [`MT_REQUEST`],
//! which carries a serialized structured request.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-assigned, process-unique identifier of one engine session ("expert handle").
pub type SessionHandle = i32;

/// Operation code the engine reports when it has nothing to execute.
pub const NO_COMMAND: i32 = 0;
/// Reserved operation code whose sole argument is a serialized `StructuredRequest`.
pub const MT_REQUEST: i32 = 155;

/// A single positional or named argument.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Int(i32),
    Long(i64),
    ULong(u64),
    Double(f64),
    Bool(bool),
    String(String),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Arg {
    /// Integer value, widening is not attempted.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit value; `Int` is widened.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(i64::from(*v)),
            Arg::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Unsigned 64-bit value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Arg::ULong(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point value; integers are converted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Double(v) => Some(*v),
            Arg::Int(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! arg_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Arg {
            fn from(value: $ty) -> Self {
                Arg::$variant(value.into())
            }
        })*
    };
}

arg_from! {
    i32 => Int,
    i64 => Long,
    u64 => ULong,
    f64 => Double,
    bool => Bool,
    String => String,
    &str => String,
    Vec<i32> => IntArray,
    Vec<i64> => LongArray,
    Vec<f64> => DoubleArray,
    Vec<String> => StringArray,
}

/// Command payload sent from the client to the engine session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Operation code resolved by the engine.
    pub command_type: i32,
    /// Ordered positional arguments.
    #[serde(default)]
    pub parameters: Vec<Arg>,
    /// Sparse optional arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_params: Option<BTreeMap<String, Arg>>,
    /// Target session.
    pub expert_handle: SessionHandle,
}

impl Command {
    /// Creates a command with positional arguments only.
    pub fn new(command_type: i32, parameters: Vec<Arg>, expert_handle: SessionHandle) -> Self {
        Command {
            command_type,
            parameters,
            named_params: None,
            expert_handle,
        }
    }

    /// Attaches named arguments.
    pub fn with_named(mut self, named: BTreeMap<String, Arg>) -> Self {
        self.named_params = Some(named);
        self
    }

    /// Positional argument at `index`, if present.
    pub fn param(&self, index: usize) -> Option<&Arg> {
        self.parameters.get(index)
    }

    /// Named argument, if the command carries named arguments and contains `name`.
    pub fn named(&self, name: &str) -> Option<&Arg> {
        self.named_params.as_ref().and_then(|named| named.get(name))
    }

    /// Whether the named argument `name` is present.
    pub fn contains_named(&self, name: &str) -> bool {
        self.named(name).is_some()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandType = {}; ExpertHandle = {}",
            self.command_type, self.expert_handle
        )
    }
}
