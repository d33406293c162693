//! Host trust-store registration.
//!
//! Each platform exposes its store through an administrative utility. The
//! backend is picked once at startup with [`detect_backend`].

mod backend;
mod command;

pub use backend::{
    AppleBackend, LINUX_CA_DIR, LinuxBackend, SYSTEM_KEYCHAIN, TrustEntry, TrustError,
    TrustStoreBackend, WindowsBackend, detect_backend, detect_backend_with,
};
pub use command::{CommandRunner, SystemRunner};

#[cfg(test)]
pub(crate) mod testing {
    //! Recording doubles for trust-store tests.

    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::command::command_line;
    use super::{CommandRunner, TrustEntry, TrustError, TrustStoreBackend};

    /// Records every command line and fails those containing a marker.
    #[derive(Clone, Default)]
    pub struct RecordingRunner {
        commands: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingRunner {
        pub fn succeeding() -> Self {
            Self::default()
        }

        pub fn failing_on(marker: &'static str) -> Self {
            Self {
                fail_on: Some(marker),
                ..Self::default()
            }
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<(), TrustError> {
            let command = command_line(program, args);
            self.commands.lock().unwrap().push(command.clone());
            match self.fail_on {
                Some(marker) if command.contains(marker) => Err(TrustError::CommandFailed {
                    command,
                    status: Some(1),
                }),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct Counts {
        register_attempts: usize,
        registered: usize,
        unregistered: usize,
        removed: Vec<TrustEntry>,
        entries: Vec<TrustEntry>,
    }

    /// Counts register/unregister calls made by an identity.
    #[derive(Clone, Default)]
    pub struct RecordingBackend {
        counts: Arc<Mutex<Counts>>,
        fail_register: bool,
        fail_unregister: bool,
    }

    impl RecordingBackend {
        pub fn succeeding() -> Self {
            Self::default()
        }

        pub fn failing_register() -> Self {
            Self {
                fail_register: true,
                ..Self::default()
            }
        }

        pub fn failing_unregister() -> Self {
            Self {
                fail_unregister: true,
                ..Self::default()
            }
        }

        pub fn register_attempts(&self) -> usize {
            self.counts.lock().unwrap().register_attempts
        }

        /// Successful registrations.
        pub fn registered(&self) -> usize {
            self.counts.lock().unwrap().registered
        }

        /// Unregister attempts, successful or not.
        pub fn unregistered(&self) -> usize {
            self.counts.lock().unwrap().unregistered
        }

        /// Entries passed to successful registrations.
        pub fn entries(&self) -> Vec<TrustEntry> {
            self.counts.lock().unwrap().entries.clone()
        }

        /// Entries passed to unregister, in call order.
        pub fn removed(&self) -> Vec<TrustEntry> {
            self.counts.lock().unwrap().removed.clone()
        }
    }

    impl TrustStoreBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn register(&self, cert_path: &Path, entry: &TrustEntry) -> Result<(), TrustError> {
            let mut counts = self.counts.lock().unwrap();
            counts.register_attempts += 1;
            assert!(cert_path.exists(), "certificate must be materialized first");
            if self.fail_register {
                return Err(TrustError::CommandFailed {
                    command: "register".into(),
                    status: Some(1),
                });
            }
            counts.registered += 1;
            counts.entries.push(entry.clone());
            Ok(())
        }

        fn unregister(&self, entry: &TrustEntry) -> Result<(), TrustError> {
            let mut counts = self.counts.lock().unwrap();
            counts.unregistered += 1;
            counts.removed.push(entry.clone());
            if self.fail_unregister {
                return Err(TrustError::CommandFailed {
                    command: "unregister".into(),
                    status: Some(1),
                });
            }
            Ok(())
        }
    }
}
