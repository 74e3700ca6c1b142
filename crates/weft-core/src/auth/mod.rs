//! Helpers shared by credential providers.

pub mod callback;

pub use callback::{
    CallbackResult, CallbackServer, CompletionSignal, SignalOutcome, build_redirect_uri,
    parse_authorization_input, random_local_port,
};
