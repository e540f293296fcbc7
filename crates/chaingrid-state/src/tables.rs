//! redb table definitions for the ChainGrid registries.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Submissions and process chains additionally get an
//! insertion sequence number so fetches can honor FIFO order.

use redb::TableDefinition;

/// A table of JSON-serialized records keyed by id.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// A table mapping insertion sequence numbers to record ids.
pub type OrderTable = TableDefinition<'static, u64, &'static str>;

/// Submissions keyed by `{submission_id}`.
pub const SUBMISSIONS: JsonTable = TableDefinition::new("submissions");

/// Submission ids keyed by insertion sequence number.
pub const SUBMISSION_ORDER: OrderTable = TableDefinition::new("submission_order");

/// Process chain records keyed by `{process_chain_id}`.
pub const PROCESS_CHAINS: JsonTable = TableDefinition::new("process_chains");

/// Process chain ids keyed by insertion sequence number.
pub const PROCESS_CHAIN_ORDER: OrderTable = TableDefinition::new("process_chain_order");

/// VMs keyed by `{vm_id}`.
pub const VMS: JsonTable = TableDefinition::new("vms");
