mod exchange_test;
mod journal_test;
mod mvcc_test;
mod recovery_test;
mod split_test;
mod traverse_test;
mod tx_test;
mod volume_test;
