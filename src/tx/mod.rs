//! Transaction management - fee estimation, attempt building and resending

pub mod attempt;
pub mod fees;
pub mod resender;
pub mod types;

pub use attempt::AttemptBuilder;
pub use fees::{FeeEstimator, GasEstimator};
pub use resender::Resender;
pub use types::{AttemptState, Fee, Tx, TxAttempt, TxState};
