//! Quote snapshot of one engine session.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::SessionHandle;

/// Latest bid/ask of the instrument a session is attached to.
///
/// Quotes are values: an update replaces the previous snapshot instead of mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument name.
    pub instrument: String,
    /// Bid price.
    pub bid: f64,
    /// Ask price.
    pub ask: f64,
    /// Owning session.
    pub expert_handle: SessionHandle,
}

impl Quote {
    /// Creates a quote snapshot.
    pub fn new(instrument: &str, bid: f64, ask: f64, expert_handle: SessionHandle) -> Self {
        Quote {
            instrument: instrument.to_string(),
            bid,
            ask,
            expert_handle,
        }
    }

    /// Whether both prices are finite and so can be encoded as JSON.
    pub fn is_finite(&self) -> bool {
        self.bid.is_finite() && self.ask.is_finite()
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instrument = {}; Bid = {}; Ask = {}; ExpertHandle = {}",
            self.instrument, self.bid, self.ask, self.expert_handle
        )
    }
}
