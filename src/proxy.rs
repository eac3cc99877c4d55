use anyhow::{Context as _, Result};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// The request/response channel to the external IMAP-proxy process.
///
/// One newline-terminated command goes out, the full reply comes back; the
/// call blocks until the proxy has answered. `send` takes `&mut self` so a
/// handle can never carry two in-flight requests.
pub trait Proxy {
    fn send(&mut self, line: &str) -> Result<String>;
}

/// Talks to the proxy over a Unix-domain socket. Each request opens a fresh
/// connection, writes the command and reads the reply to EOF, mirroring the
/// proxy's one-shot connection model.
pub struct UnixProxy {
    socket_path: PathBuf,
}

impl UnixProxy {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

impl Proxy for UnixProxy {
    fn send(&mut self, line: &str) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("connecting to proxy at {}", self.socket_path.display()))?;

        stream.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            stream.write_all(b"\n")?;
        }

        let mut reply = String::new();
        stream.read_to_string(&mut reply)?;
        log::debug!("proxy: {} -> {} bytes", line.trim_end(), reply.len());
        Ok(reply)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Replays canned replies and records every command sent, for tests
    /// that exercise the remote code paths without a proxy process.
    pub struct ScriptedProxy {
        pub sent: Rc<RefCell<Vec<String>>>,
        replies: VecDeque<String>,
    }

    impl ScriptedProxy {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                sent: Rc::new(RefCell::new(Vec::new())),
                replies: replies.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Proxy for ScriptedProxy {
        fn send(&mut self, line: &str) -> Result<String> {
            self.sent.borrow_mut().push(line.trim_end().to_string());
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }
}
