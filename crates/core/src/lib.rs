pub mod build_record;
pub mod chunk;
pub mod keyspace;
pub mod kv;
pub mod master;
pub mod ordering;
pub mod supervisor;
pub mod timing;
pub mod worker;

pub use build_record::BuildRecord;
pub use chunk::{Chunk, Executable};
pub use keyspace::Keyspace;
pub use kv::{Kv, MemoryKv, RedisKv};
pub use master::MasterCoordinator;
pub use supervisor::{Supervisor, SupervisorOutcome};
pub use worker::{Executor, UnitResult, WorkerLoop, WorkerLoopOutcome};
