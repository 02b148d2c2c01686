//! The parent→child bring-up pipe.
//!
//! The child blocks reading its bring-up record from fd 3 until the
//! parent has finished cgroup and veth setup; the write (or a close
//! without data on failure) is the sole release barrier of the
//! handshake. A closed-empty pipe makes the child's decode fail and the
//! child exit instead of proceeding half-configured.

use std::fs::File;
use std::io::{BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Where the read end lands in the child.
pub const CONFIG_FD: RawFd = 3;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("failed to create bring-up pipe: {0}")]
    Create(nix::Error),
    #[error("failed to write bring-up record: {0}")]
    Write(std::io::Error),
    #[error("failed to encode bring-up record: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode bring-up record: {0}")]
    Decode(serde_json::Error),
}

/// Read end, inherited by the child and moved to fd 3 there.
pub struct ConfigReader {
    fd: OwnedFd,
}

impl ConfigReader {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Write end, held by the parent. Dropping it without [`send`] closes
/// the pipe empty, which aborts the child.
///
/// [`send`]: ConfigWriter::send
pub struct ConfigWriter {
    fd: OwnedFd,
}

impl ConfigWriter {
    /// Writes the record and closes the pipe, releasing the child.
    pub fn send<T: Serialize>(self, value: &T) -> Result<(), PipeError> {
        let mut file = File::from(self.fd);
        serde_json::to_writer(&mut file, value).map_err(PipeError::Encode)?;
        file.flush().map_err(PipeError::Write)?;
        Ok(())
    }
}

/// Both ends are CLOEXEC: the child's inherited copies vanish at its
/// exec, so the only write end left is the parent's and closing it is a
/// reliable EOF for the child. The spawn path re-arms fd 3 explicitly.
pub fn config_pipe() -> Result<(ConfigReader, ConfigWriter), PipeError> {
    let (read, write) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(PipeError::Create)?;
    let read = unsafe { OwnedFd::from_raw_fd(read) };
    let write = unsafe { OwnedFd::from_raw_fd(write) };
    Ok((ConfigReader { fd: read }, ConfigWriter { fd: write }))
}

/// Child side: reads the bring-up record from fd 3. Blocks until the
/// parent writes or closes.
///
/// # Safety contract
/// Assumes fd 3 was set up by the spawn path and is owned by this call;
/// the fd is consumed.
pub fn read_bring_up<T: DeserializeOwned>() -> Result<T, PipeError> {
    let file = unsafe { File::from_raw_fd(CONFIG_FD) };
    serde_json::from_reader(BufReader::new(file)).map_err(PipeError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd;
    use serde::Deserialize;
    use serial_test::serial;

    #[derive(Serialize, Deserialize)]
    struct Record {
        name: String,
        ip: String,
    }

    // These fork; keep them serial so unrelated tests don't race on fds.

    #[test]
    #[serial]
    fn test_record_crosses_the_pipe() {
        let (reader, writer) = config_pipe().expect("create pipe");

        match unsafe { unistd::fork() }.expect("fork") {
            unistd::ForkResult::Parent { child } => {
                drop(reader);
                writer
                    .send(&Record {
                        name: "web".to_string(),
                        ip: "10.20.0.2".to_string(),
                    })
                    .expect("send record");
                match waitpid(child, None).expect("waitpid") {
                    WaitStatus::Exited(_, code) => assert_eq!(code, 0),
                    status => panic!("unexpected child status {status:?}"),
                }
            }
            unistd::ForkResult::Child => {
                // the exec would close this copy via CLOEXEC; the fork
                // in this test has to do it by hand or EOF never comes
                drop(writer);
                let ok = unistd::dup2(reader.raw_fd(), CONFIG_FD).is_ok()
                    && matches!(
                        read_bring_up::<Record>(),
                        Ok(record) if record.name == "web" && record.ip == "10.20.0.2"
                    );
                std::process::exit(if ok { 0 } else { 1 });
            }
        }
    }

    #[test]
    #[serial]
    fn test_closed_empty_pipe_aborts_the_reader() {
        let (reader, writer) = config_pipe().expect("create pipe");

        match unsafe { unistd::fork() }.expect("fork") {
            unistd::ForkResult::Parent { child } => {
                drop(reader);
                // closing without data is the failure signal
                drop(writer);
                match waitpid(child, None).expect("waitpid") {
                    WaitStatus::Exited(_, code) => assert_eq!(code, 0),
                    status => panic!("unexpected child status {status:?}"),
                }
            }
            unistd::ForkResult::Child => {
                drop(writer);
                let failed = unistd::dup2(reader.raw_fd(), CONFIG_FD).is_ok()
                    && read_bring_up::<Record>().is_err();
                std::process::exit(if failed { 0 } else { 1 });
            }
        }
    }
}
