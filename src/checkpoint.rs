use log::info;

use crate::{
    buffer::Session,
    database::Database,
    error::StoreError,
    journal::{
        record::{CpPayload, RecordKind},
        Checkpoint,
    },
};

/// Take one checkpoint: journal every dirty page, force the journal
/// so all earlier commits are durable, write the CP record (with the
/// live accumulator snapshot), fsync it, and advance the journal base
/// address.
///
/// `checkpoint(); checkpoint()` leaves the same persisted state as a
/// single call.
pub fn run_checkpoint() -> Result<Checkpoint, StoreError> {
    let session = Session::new(Database::claim_timeout());

    // the checkpoint has its own timestamp; recovered timestamp
    // floors account for it
    let timestamp = Database::timestamps().allocate();

    // step 1: every page dirtied before this point gets its image
    // into the journal
    Database::buffer_pool().write_dirty_pages(&session, true)?;

    // step 2: all earlier commits reach durable state
    Database::journal_manager().force()?;

    // step 3: fresh map snapshots, then the CP record itself
    Database::journal_manager().append_map_snapshots()?;
    let mut accumulators = Vec::new();
    for tree in Database::catalog().trees() {
        accumulators.extend(tree.accumulators().snapshot(tree.id()));
    }
    let payload = CpPayload {
        timestamp,
        base_address: Database::journal_manager().base_address(),
        accumulators,
    }
    .encode();
    let addr = Database::journal_manager().append_record(RecordKind::CP, &payload)?;

    // step 4: a checkpoint is durable only once its CP record is
    // fsynced
    Database::journal_manager().force()?;

    let cp = Checkpoint { timestamp, addr };
    Database::journal_manager().note_checkpoint(cp);

    // commits every snapshot has moved past read as ancient history;
    // their table entries can go
    let floor = Database::transaction_index()
        .oldest_running_start()
        .unwrap_or_else(|| Database::timestamps().current());
    Database::transaction_index().retire_committed_before(floor);

    let base = Database::journal_manager().recompute_base()?;
    info!(
        "checkpoint at ts {} (journal address {}), base address {}",
        timestamp, addr, base
    );
    Ok(cp)
}
