pub mod accumulator;
pub mod mvv;
pub mod sequencer;
pub mod tx;
pub mod tx_index;

pub use accumulator::{AccumKind, AccumulatorSet};
pub use sequencer::WwSequencer;
pub use tx::{run_transaction, Transaction};
pub use tx_index::TransactionIndex;
