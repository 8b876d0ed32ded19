// FTP implementation of StoryServer.
//
// suppaftp's blocking client runs on the blocking pool. One session is kept
// open between calls and revalidated with NOOP; a dead session is replaced
// transparently.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, warn};

use crate::error::{InewsError, Result};
use crate::listing::{parse_listing, DirEntry};
use crate::{path_segments, StoryServer};

#[derive(Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub struct FtpStoryServer {
    settings: Arc<FtpSettings>,
    session: Arc<Mutex<Option<FtpStream>>>,
}

impl FtpStoryServer {
    pub fn new(settings: FtpSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Close the session if one is open. The next call reconnects.
    pub async fn disconnect(&self) {
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut slot) = session.lock() {
                if let Some(mut stream) = slot.take() {
                    let _ = stream.quit();
                    info!("Disconnected from story server");
                }
            }
        })
        .await;
    }

    /// Current working directory of the session.
    pub async fn pwd(&self) -> Result<String> {
        self.with_session(|stream| {
            stream
                .pwd()
                .map_err(|e| InewsError::Connection(e.to_string()))
        })
        .await
    }

    /// Run `op` against a live session on the blocking pool.
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let settings = self.settings.clone();
        let session = self.session.clone();

        tokio::task::spawn_blocking(move || {
            let mut slot = session
                .lock()
                .map_err(|_| InewsError::Connection("session lock poisoned".into()))?;
            let stream = ensure_connected(&mut slot, &settings)?;
            let result = op(stream);
            if let Err(e) = &result {
                if e.is_transient() {
                    if let Some(mut broken) = slot.take() {
                        let _ = broken.quit();
                    }
                }
            }
            result
        })
        .await
        .map_err(|e| InewsError::Connection(format!("ftp task failed: {e}")))?
    }
}

#[async_trait]
impl StoryServer for FtpStoryServer {
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let dir = dir.to_string();
        self.with_session(move |stream| {
            navigate(stream, &dir)?;
            let lines = stream.list(None).map_err(|e| classify(e, &dir))?;
            debug!(dir = dir.as_str(), lines = lines.len(), "Listed directory");
            Ok(parse_listing(lines))
        })
        .await
    }

    async fn read(&self, dir: &str, name: &str) -> Result<String> {
        let dir = dir.to_string();
        let name = name.to_string();
        self.with_session(move |stream| {
            navigate(stream, &dir)?;
            let buffer = stream.retr_as_buffer(&name).map_err(|e| match e {
                FtpError::ConnectionError(io) => InewsError::Connection(io.to_string()),
                other => InewsError::Transfer {
                    name: name.clone(),
                    message: other.to_string(),
                },
            })?;
            Ok(decode_story(&buffer.into_inner()))
        })
        .await
    }
}

fn ensure_connected<'a>(
    slot: &'a mut Option<FtpStream>,
    settings: &FtpSettings,
) -> Result<&'a mut FtpStream> {
    let alive = match slot.as_mut() {
        Some(stream) => stream.noop().is_ok(),
        None => false,
    };
    if !alive {
        if let Some(mut stale) = slot.take() {
            warn!("Story server session lost, reconnecting");
            let _ = stale.quit();
        }
        *slot = Some(connect(settings)?);
    }
    slot.as_mut()
        .ok_or_else(|| InewsError::Connection("no session".into()))
}

fn connect(settings: &FtpSettings) -> Result<FtpStream> {
    info!(host = settings.host.as_str(), port = settings.port, "Connecting to story server");

    let addr = resolve(&settings.host, settings.port)?;
    let mut stream = FtpStream::connect_timeout(addr, settings.timeout)
        .map_err(|e| InewsError::Connection(e.to_string()))?;
    stream
        .get_ref()
        .set_read_timeout(Some(settings.timeout))
        .map_err(|e| InewsError::Connection(e.to_string()))?;
    stream
        .login(&settings.user, &settings.password)
        .map_err(|e| InewsError::Connection(format!("login failed: {e}")))?;

    // Not every server knows this command.
    if let Err(e) = stream.site("CHARSET UTF-8") {
        debug!(error = %e, "SITE CHARSET rejected, keeping server default");
    }

    info!(host = settings.host.as_str(), "Story server session established");
    Ok(stream)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| InewsError::Connection(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| InewsError::Connection(format!("no address for {host}")))
}

/// Change to `path` one folder at a time, starting from the root.
fn navigate(stream: &mut FtpStream, path: &str) -> Result<()> {
    stream.cwd("/").map_err(|e| classify(e, "/"))?;
    for folder in path_segments(path) {
        stream.cwd(folder).map_err(|e| classify(e, path))?;
    }
    Ok(())
}

fn classify(err: FtpError, path: &str) -> InewsError {
    match err {
        FtpError::ConnectionError(io) => InewsError::Connection(io.to_string()),
        other => InewsError::Path {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

/// Story bytes to text with unix line endings. Invalid UTF-8 is replaced,
/// not rejected.
pub(crate) fn decode_story(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}
