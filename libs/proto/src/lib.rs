//! # symphony-proto
//!
//! Wire protocol for the persistent node ⇄ conductor stream.
//!
//! The transport is a mutually-authenticated TLS connection carrying
//! length-delimited frames (4-byte big-endian length prefix, bounded
//! size). Each frame is one JSON-encoded [`NodeToConductor`] or
//! [`ConductorToNode`] message.
//!
//! This crate also holds the state enums and resource snapshot models
//! shared between the conductor and the node.

mod framing;
mod models;
mod wire;

pub use framing::{FrameCodec, FrameError, MAX_FRAME_SIZE};
pub use models::{
    CpuCoreUsage, CpuDynamic, CpuStatic, CurrentState, DeployKind, DesiredState, DynamicResources,
    GpuDynamic, GpuStatic, LogStream, MemoryDynamic, MemoryStatic, StaticResources,
    StorageMountDynamic, StorageMountStatic,
};
pub use wire::{
    Ack, CondaEnvEnsure, CondaEnvReport, CondaEnvSpec, ConductorToNode, DeploymentAction,
    DeploymentCancel, DeploymentReq, DeploymentStatus, DeploymentStatusList, Heartbeat, LogBatch,
    LogEntry, LogSubscribe, LogUnsubscribe, NodeHello, NodeToConductor, WireError,
};
