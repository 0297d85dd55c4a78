// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Common Library
// Host table allocation, loopback aliases and SSH tunnel supervision

pub mod alias;
pub mod allocator;
pub mod config;
pub mod error;
pub mod hosts;
pub mod logs;
pub mod manager;
pub mod network;
pub mod permissions;
pub mod process;
pub mod profile;
pub mod supervisor;

pub use alias::{AliasBinder, SystemAliasBinder};
pub use allocator::{allocate, Allocation, AllocationRange};
pub use config::{PathSettings, SessionConfig, TunnelSettings};
pub use error::{Error, Result};
pub use hosts::{validate_hostname, HostEntry, HostTable, MANAGED_TAG};
pub use manager::{AddOutcome, LocalForward, StartOutcome, TunnelStatus};
pub use permissions::is_elevated;
pub use process::{ProcessControl, ProcessHandle, SystemProcessControl};
pub use profile::{ConnectionProfile, ProfileResolver, ProfileStore, SshConfigStore};
pub use supervisor::{
    build_launch_spec, ForwardDirective, LaunchSpec, StopOutcome, TunnelState, TunnelSupervisor,
};
