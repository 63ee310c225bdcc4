//! Kernel command construction and process supervision.

pub mod command;
pub mod supervisor;

pub use command::{BuildError, CommandBuilder, KernelCommand, SUBSCRIBE_FLAG};
pub use supervisor::{
    KernelChild, KernelProcess, KernelStatus, KernelSupervisor, SpawnError, Spawner, StatusBoard,
    TokioSpawner,
};
