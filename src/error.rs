//! Crate-wide error type.
//!
//! Every remote failure is caught at the call site and turned into a
//! user-facing notice via [`Error::user_message`]; nothing here is meant to
//! bubble up as a panic.

use thiserror::Error;

use crate::model::OrderStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Local cart problems. Detected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("Your order is empty")]
    EmptyCart,
    #[error("Please choose {modifier} for {item}")]
    MissingRequired { item: String, modifier: String },
    #[error("{modifier} is not an option of {item}")]
    UnknownModifier { item: String, modifier: String },
    #[error("Option {option} does not belong to {modifier}")]
    UnknownOption { modifier: String, option: String },
    #[error("{modifier} is a {expected} choice")]
    KindMismatch { modifier: String, expected: String },
    #[error("No drink at position {0}")]
    NoSuchEntry(usize),
    #[error("Drink count must be at least 1")]
    ZeroCount,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] CartError),

    /// The remote service answered with an error. `message` is the service's
    /// own text and is shown verbatim.
    #[error("{message}")]
    Remote { status: Option<u16>, message: String },

    #[error("{0}")]
    Transport(String),

    /// A write reported success but touched nothing.
    #[error("No {table} row was updated for {id}")]
    NoRowsAffected { table: String, id: String },

    #[error("Cannot move an order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order {0} is already being updated")]
    TransitionInFlight(String),

    #[error("An order is already being submitted")]
    SubmissionInFlight,

    #[error("{0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Gate(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Realtime subscription failed: {0}")]
    Subscription(String),
}

impl Error {
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Remote {
            status,
            message: message.into(),
        }
    }

    /// Text shown to the user in a toast or inline notice.
    pub fn user_message(&self) -> String {
        match self {
            Error::Remote { message, .. } => message.clone(),
            Error::NoRowsAffected { .. } => {
                "The order was not updated. It may have changed or been removed; reload and try again."
                    .to_string()
            }
            other => other.to_string(),
        }
    }

    /// Fatal errors put the affected view into a static error state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
