// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Orchestration
// Wires host table, allocator, alias binding, profiles and the supervisor
// together for each user-facing operation.
//
// Invocations are expected to be serialized by the caller: nothing here locks
// the hosts file, the pid record or the session config.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::alias::AliasBinder;
use crate::allocator::{allocate, Allocation};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::hosts::{validate_hostname, HostEntry, HostTable};
use crate::process::ProcessControl;
use crate::profile::{ConnectionProfile, ProfileResolver, ProfileStore};
use crate::supervisor::{ForwardDirective, StopOutcome, TunnelState, TunnelSupervisor};

/// Result of `add_host`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New entry appended and bound; `restarted` is set if a live tunnel was
    /// relaunched to pick it up
    Added {
        address: Ipv4Addr,
        restarted: Option<StartOutcome>,
    },
    /// The hostname already had an address; nothing was changed
    AlreadyConfigured { address: Ipv4Addr },
}

/// A freshly launched tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub pid: u32,
    pub profile: ConnectionProfile,
    pub forwards: Vec<ForwardDirective>,
    pub log_path: PathBuf,
}

/// Snapshot for `status` and `list`
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    #[serde(flatten)]
    pub state: TunnelState,
    pub default_profile: Option<String>,
    pub hosts: Vec<HostEntry>,
    pub hosts_file: PathBuf,
    pub log_path: PathBuf,
}

pub struct LocalForward<'a> {
    session: SessionConfig,
    hosts: HostTable,
    aliases: &'a dyn AliasBinder,
    profiles: &'a dyn ProfileStore,
    supervisor: TunnelSupervisor<'a>,
}

impl<'a> LocalForward<'a> {
    pub fn new(
        session: SessionConfig,
        aliases: &'a dyn AliasBinder,
        profiles: &'a dyn ProfileStore,
        processes: &'a dyn ProcessControl,
    ) -> Result<Self> {
        session.validate()?;
        let hosts = HostTable::new(session.hosts_file());
        let supervisor = TunnelSupervisor::new(
            session.state_dir(),
            processes,
            session.tunnel.stop_timeout(),
        )
        .with_program(session.tunnel.ssh_binary.clone());

        Ok(Self {
            session,
            hosts,
            aliases,
            profiles,
            supervisor,
        })
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn supervisor(&self) -> &TunnelSupervisor<'a> {
        &self.supervisor
    }

    /// Managed host entries in file order
    pub fn entries(&self) -> Result<Vec<HostEntry>> {
        self.hosts.list_tagged_entries()
    }

    /// Give `name` a loopback address, bind it, and refresh a live tunnel
    ///
    /// If binding fails the hosts entry stays in place; there is no rollback.
    pub fn add_host(&mut self, name: &str) -> Result<AddOutcome> {
        validate_hostname(name)?;

        let range = self.session.tunnel.allocation_range()?;
        let entries = self.hosts.list_tagged_entries()?;

        let address = match allocate(name, &entries, range)? {
            Allocation::AlreadyConfigured(address) => {
                return Ok(AddOutcome::AlreadyConfigured { address });
            }
            Allocation::Assigned(address) => address,
        };

        info!("Assigning {} to {}", address, name);
        self.hosts.append_entry(address, name)?;
        self.aliases.bind(address)?;

        let restarted = if self.supervisor.state().is_running() {
            info!("Restarting tunnel to pick up {}", name);
            let profile = self.profile_for_relaunch(None)?;
            Some(self.relaunch(profile)?)
        } else {
            None
        };

        Ok(AddOutcome::Added { address, restarted })
    }

    /// Launch the tunnel with one forward per managed host
    pub fn start(&mut self, profile: Option<&str>) -> Result<StartOutcome> {
        if let TunnelState::Running { pid } = self.supervisor.state() {
            return Err(Error::AlreadyRunning(pid));
        }

        let profile = ProfileResolver::new(self.profiles).resolve(profile, &mut self.session)?;
        self.launch(profile)
    }

    fn launch(&self, profile: ConnectionProfile) -> Result<StartOutcome> {
        let entries = self.hosts.list_tagged_entries()?;
        let pid = self
            .supervisor
            .start(&profile, &entries, &self.session.tunnel)?;

        let forwards = entries
            .iter()
            .map(|entry| ForwardDirective::for_entry(entry, self.session.tunnel.remote_port))
            .collect();

        Ok(StartOutcome {
            pid,
            profile,
            forwards,
            log_path: self.supervisor.log_path(),
        })
    }

    pub fn stop(&self) -> Result<StopOutcome> {
        self.supervisor.stop()
    }

    /// Stop (tolerating nothing running) then start with `profile`, or with
    /// the profile the running tunnel was launched with, or the default
    ///
    /// The profile is resolved before anything is stopped, so a bad name
    /// leaves a running tunnel alone.
    pub fn restart(&mut self, profile: Option<&str>) -> Result<StartOutcome> {
        let profile = self.profile_for_relaunch(profile)?;
        self.relaunch(profile)
    }

    fn profile_for_relaunch(&mut self, requested: Option<&str>) -> Result<ConnectionProfile> {
        match (requested, self.supervisor.running_profile()) {
            (None, Some(running)) => self.profiles.lookup(&running),
            (requested, _) => {
                ProfileResolver::new(self.profiles).resolve(requested, &mut self.session)
            }
        }
    }

    /// Replace the running tunnel; never leaves two alive
    fn relaunch(&self, profile: ConnectionProfile) -> Result<StartOutcome> {
        match self.supervisor.stop()? {
            StopOutcome::Stopped { pid, exited: true } => info!("Stopped PID {} for restart", pid),
            StopOutcome::Stopped { pid, exited: false } => {
                warn!("PID {} ignored SIGTERM; killing it before restart", pid);
                if !self.supervisor.kill(pid)? {
                    return Err(Error::AlreadyRunning(pid));
                }
            }
            StopOutcome::NotRunning => info!("No tunnel was running; starting fresh"),
        }
        self.launch(profile)
    }

    pub fn status(&self) -> Result<TunnelStatus> {
        Ok(TunnelStatus {
            state: self.supervisor.state(),
            default_profile: self.session.default_profile.clone(),
            hosts: self.hosts.list_tagged_entries()?,
            hosts_file: self.hosts.path().to_path_buf(),
            log_path: self.supervisor.log_path(),
        })
    }

    /// Store the default profile without checking it exists
    pub fn set_default_profile(&mut self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Config("profile name cannot be empty".to_string()));
        }
        self.session.default_profile = Some(name.to_string());
        self.session.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::testing::FakeProcesses;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingBinder {
        bound: RefCell<Vec<Ipv4Addr>>,
        fail: bool,
    }

    impl AliasBinder for RecordingBinder {
        fn bind(&self, address: Ipv4Addr) -> Result<()> {
            if self.fail {
                return Err(Error::Command {
                    command: format!("ifconfig lo0 alias {}", address),
                    code: Some(1),
                });
            }
            self.bound.borrow_mut().push(address);
            Ok(())
        }
    }

    struct Profiles;

    impl ProfileStore for Profiles {
        fn lookup(&self, name: &str) -> Result<ConnectionProfile> {
            match name {
                "bastion" => Ok(ConnectionProfile {
                    name: name.to_string(),
                    hostname: "bastion".to_string(),
                    user: "alice".to_string(),
                    port: None,
                    identity_file: Some(PathBuf::from("/keys/id")),
                }),
                _ => Err(Error::ProfileNotFound(name.to_string())),
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        binder: RecordingBinder,
        processes: FakeProcesses,
    }

    impl Fixture {
        fn new(range_end: u8) -> Self {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();
            fs::write(
                dir.path().join("config.toml"),
                format!(
                    "[tunnel]\nrange_end = {}\nstop_timeout_secs = 0\n\n[paths]\nhosts_file = {:?}\nstate_dir = {:?}\n",
                    range_end,
                    dir.path().join("hosts"),
                    dir.path().join("state"),
                ),
            )
            .unwrap();
            Self {
                dir,
                binder: RecordingBinder::default(),
                processes: FakeProcesses::default(),
            }
        }

        fn app(&self) -> LocalForward<'_> {
            let session = SessionConfig::load_from(&self.dir.path().join("config.toml")).unwrap();
            LocalForward::new(session, &self.binder, &Profiles, &self.processes).unwrap()
        }

        fn hosts(&self) -> String {
            fs::read_to_string(self.dir.path().join("hosts")).unwrap()
        }
    }

    #[test]
    fn test_add_allocates_lowest_and_is_idempotent() {
        let fixture = Fixture::new(5);
        let mut app = fixture.app();

        assert_eq!(
            app.add_host("svc-a").unwrap(),
            AddOutcome::Added {
                address: Ipv4Addr::new(127, 0, 0, 2),
                restarted: None
            }
        );
        assert_eq!(
            app.add_host("svc-b").unwrap(),
            AddOutcome::Added {
                address: Ipv4Addr::new(127, 0, 0, 3),
                restarted: None
            }
        );

        let before = fixture.hosts();
        assert_eq!(
            app.add_host("svc-a").unwrap(),
            AddOutcome::AlreadyConfigured {
                address: Ipv4Addr::new(127, 0, 0, 2)
            }
        );
        assert_eq!(fixture.hosts(), before);
        assert_eq!(
            *fixture.binder.bound.borrow(),
            vec![Ipv4Addr::new(127, 0, 0, 2), Ipv4Addr::new(127, 0, 0, 3)]
        );
    }

    #[test]
    fn test_add_exhausts_range() {
        let fixture = Fixture::new(5);
        let mut app = fixture.app();

        for name in ["a", "b", "c", "d"] {
            assert!(matches!(app.add_host(name).unwrap(), AddOutcome::Added { .. }));
        }
        assert!(matches!(
            app.add_host("e"),
            Err(Error::ResourceExhausted { first: 2, last: 5 })
        ));
        assert_eq!(app.entries().unwrap().len(), 4);
    }

    #[test]
    fn test_add_rejects_invalid_hostname() {
        let fixture = Fixture::new(5);
        let mut app = fixture.app();
        assert!(matches!(
            app.add_host("bad name"),
            Err(Error::InvalidHostname(_))
        ));
        assert_eq!(fixture.hosts(), "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_bind_failure_keeps_entry() {
        let mut fixture = Fixture::new(5);
        fixture.binder.fail = true;
        let mut app = fixture.app();

        assert!(matches!(app.add_host("svc-a"), Err(Error::Command { .. })));
        // No rollback: the entry stays and a retry reports it as configured
        assert!(matches!(
            app.add_host("svc-a").unwrap(),
            AddOutcome::AlreadyConfigured { .. }
        ));
    }

    #[test]
    fn test_start_builds_forwards_for_all_hosts() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        app.add_host("svc-a").unwrap();
        app.add_host("svc-b").unwrap();

        let outcome = app.start(Some("bastion")).unwrap();
        let described: Vec<String> = outcome.forwards.iter().map(|f| f.to_string()).collect();
        assert_eq!(
            described,
            vec!["127.0.0.2:80 -> svc-a:80", "127.0.0.3:80 -> svc-b:80"]
        );
        assert_eq!(outcome.profile.target(), "alice@bastion");

        let launches = fixture.processes.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].target, "alice@bastion");
        assert_eq!(launches[0].forwards, outcome.forwards);

        // Last used profile became the default
        assert_eq!(app.session().default_profile.as_deref(), Some("bastion"));
    }

    #[test]
    fn test_start_without_profile_fails() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        assert!(matches!(app.start(None), Err(Error::Config(_))));
        assert!(fixture.processes.launches().is_empty());
    }

    #[test]
    fn test_start_twice_is_already_running() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        let first = app.start(Some("bastion")).unwrap();
        assert!(matches!(
            app.start(None),
            Err(Error::AlreadyRunning(pid)) if pid == first.pid
        ));
        assert_eq!(fixture.processes.alive(), vec![first.pid]);
    }

    #[test]
    fn test_add_restarts_running_tunnel() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        app.add_host("svc-a").unwrap();
        let first = app.start(Some("bastion")).unwrap();

        let restart = match app.add_host("svc-b").unwrap() {
            AddOutcome::Added {
                restarted: Some(restart),
                ..
            } => restart,
            other => panic!("expected a restart, got {:?}", other),
        };

        assert_ne!(restart.pid, first.pid);
        assert_eq!(restart.forwards.len(), 2);
        assert_eq!(fixture.processes.alive(), vec![restart.pid]);
    }

    #[test]
    fn test_restart_kills_tunnel_that_ignores_sigterm() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        let first = app.start(Some("bastion")).unwrap();
        fixture.processes.make_stubborn(first.pid);

        let second = app.restart(None).unwrap();
        assert_eq!(fixture.processes.alive(), vec![second.pid]);
    }

    #[test]
    fn test_restart_refuses_when_old_tunnel_survives() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        let first = app.start(Some("bastion")).unwrap();
        fixture.processes.make_unkillable(first.pid);

        assert!(matches!(
            app.restart(None),
            Err(Error::AlreadyRunning(pid)) if pid == first.pid
        ));
        assert_eq!(fixture.processes.alive(), vec![first.pid]);
        assert_eq!(fixture.processes.launches().len(), 1);
    }

    #[test]
    fn test_add_restarts_with_launched_profile() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        let first = app.start(Some("bastion")).unwrap();
        app.set_default_profile("ghost").unwrap();

        let restart = match app.add_host("svc-a").unwrap() {
            AddOutcome::Added {
                restarted: Some(restart),
                ..
            } => restart,
            other => panic!("expected a restart, got {:?}", other),
        };

        assert_eq!(restart.profile.name, "bastion");
        assert_eq!(fixture.processes.alive(), vec![restart.pid]);
        assert_ne!(restart.pid, first.pid);
        // The explicit default is left as the user set it
        assert_eq!(app.session().default_profile.as_deref(), Some("ghost"));
    }

    #[test]
    fn test_restart_with_unknown_profile_keeps_tunnel() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        let first = app.start(Some("bastion")).unwrap();

        assert!(matches!(
            app.restart(Some("ghost")),
            Err(Error::ProfileNotFound(_))
        ));
        assert_eq!(fixture.processes.alive(), vec![first.pid]);
        assert_eq!(
            app.status().unwrap().state,
            TunnelState::Running { pid: first.pid }
        );
    }

    #[test]
    fn test_restart_when_stopped_starts_fresh() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        app.set_default_profile("bastion").unwrap();

        let outcome = app.restart(None).unwrap();
        assert_eq!(fixture.processes.alive(), vec![outcome.pid]);
    }

    #[test]
    fn test_stop_reports_not_running() {
        let fixture = Fixture::new(254);
        let app = fixture.app();
        assert_eq!(app.stop().unwrap(), StopOutcome::NotRunning);
        assert!(!fixture.dir.path().join("state").exists());
    }

    #[test]
    fn test_status_reflects_lifecycle() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        app.add_host("svc-a").unwrap();

        let status = app.status().unwrap();
        assert_eq!(status.state, TunnelState::Stopped);
        assert_eq!(status.hosts.len(), 1);

        let started = app.start(Some("bastion")).unwrap();
        assert_eq!(
            app.status().unwrap().state,
            TunnelState::Running { pid: started.pid }
        );

        app.stop().unwrap();
        assert_eq!(app.status().unwrap().state, TunnelState::Stopped);
    }

    #[test]
    fn test_set_default_profile_persists() {
        let fixture = Fixture::new(254);
        let mut app = fixture.app();
        app.set_default_profile("anything").unwrap();
        assert!(app.set_default_profile("  ").is_err());

        let reloaded = fixture.app();
        assert_eq!(reloaded.session().default_profile.as_deref(), Some("anything"));
    }
}
