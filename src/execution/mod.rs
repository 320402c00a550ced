// Signal reconciliation, bracket bookkeeping and cleanup
pub mod brackets;
pub mod reconciler;
pub mod retry;
pub mod sweeper;

pub use brackets::{BracketRecord, BracketRegistry};
pub use reconciler::{
    bracket_prices, order_size, BracketOutcome, PassReport, Reconciler, ReconcilerConfig,
    SignalOutcome,
};
pub use retry::{retry, RetryError, RetryPolicy};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
