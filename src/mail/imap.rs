//! Raw IMAP over TLS (blocking — run under `spawn_blocking`).
//!
//! Speaks just the five commands the poller needs (LOGIN, SELECT,
//! UID SEARCH, UID FETCH, UID STORE) rather than pulling in a full
//! IMAP client library.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::ImapConfig;
use crate::error::MailError;
use crate::mail::{MailSession, MailStore, Uid};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// IMAP-backed [`MailStore`]. Each `connect` opens a fresh TLS session,
/// logs in, and selects the configured folder.
pub struct ImapStore {
    config: ImapConfig,
}

impl ImapStore {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl MailStore for ImapStore {
    fn connect(&self) -> Result<Box<dyn MailSession + '_>, MailError> {
        let session = ImapSession::open(&self.config)?;
        Ok(Box::new(session))
    }
}

/// A live, folder-selected IMAP session.
pub struct ImapSession {
    stream: TlsStream,
    folder: String,
    tag_counter: u32,
}

impl ImapSession {
    fn open(config: &ImapConfig) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((&*config.host, config.port))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailError::Tls(e.to_string()))?;
        let stream = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self {
            stream,
            folder: config.folder.clone(),
            tag_counter: 0,
        };

        let greeting = session.read_line()?;
        debug!(greeting = greeting.trim(), "IMAP connected");

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !tagged_ok(&login) {
            return Err(MailError::AuthFailed {
                user: config.username.clone(),
            });
        }

        session.select_folder()?;
        Ok(session)
    }

    fn select_folder(&mut self) -> Result<(), MailError> {
        let folder = self.folder.clone();
        let resp = self.command(&format!("SELECT \"{folder}\""))?;
        if !tagged_ok(&resp) {
            return Err(MailError::Protocol(format!("SELECT {folder} refused")));
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(MailError::Closed),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect every response line up to and
    /// including the tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn fetch(&mut self, uid: &str, items: &str) -> Result<Vec<u8>, MailError> {
        let resp = self.command(&format!("UID FETCH {uid} ({items})"))?;
        if !tagged_ok(&resp) {
            return Err(MailError::Protocol(format!("FETCH {uid} failed")));
        }
        Ok(fetch_payload(&resp))
    }
}

impl MailSession for ImapSession {
    fn search_unseen(&mut self) -> Result<Vec<Uid>, MailError> {
        let resp = self.command("UID SEARCH UNSEEN")?;
        if !tagged_ok(&resp) {
            return Err(MailError::Protocol("SEARCH UNSEEN failed".into()));
        }
        Ok(search_uids(&resp))
    }

    fn fetch_date_header(&mut self, uid: &str) -> Result<Vec<u8>, MailError> {
        // BODY.PEEK leaves the \Seen flag untouched.
        self.fetch(uid, "BODY.PEEK[HEADER.FIELDS (DATE)]")
    }

    fn fetch_full(&mut self, uid: &str) -> Result<Vec<u8>, MailError> {
        self.fetch(uid, "RFC822")
    }

    fn mark_seen(&mut self, uid: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        if !tagged_ok(&resp) {
            return Err(MailError::Protocol(format!("STORE {uid} +FLAGS failed")));
        }
        Ok(())
    }

    fn reselect(&mut self) -> Result<(), MailError> {
        let resp = self.command("CLOSE")?;
        if !tagged_ok(&resp) {
            return Err(MailError::Protocol("CLOSE failed".into()));
        }
        self.select_folder()
    }
}

impl Drop for ImapSession {
    fn drop(&mut self) {
        // Best-effort logout; the TCP/TLS teardown happens regardless.
        let _ = self.command("LOGOUT");
    }
}

/// Whether the tagged completion line reports OK.
fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .is_some_and(|l| l.split_whitespace().nth(1) == Some("OK"))
}

/// Extract UIDs from a `* SEARCH ...` untagged response.
fn search_uids(lines: &[String]) -> Vec<Uid> {
    let mut uids = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("* SEARCH") {
            uids.extend(rest.split_whitespace().map(str::to_string));
        }
    }
    uids
}

/// Extract the literal payload of a FETCH response: everything between the
/// `* n FETCH (...` header line and the closing `)` line.
fn fetch_payload(lines: &[String]) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut inside = false;
    for line in lines {
        if !inside {
            if line.starts_with('*') && line.contains("FETCH") {
                inside = true;
            }
            continue;
        }
        if line.trim_end() == ")" || tagged_line(line) {
            break;
        }
        payload.extend_from_slice(line.as_bytes());
    }
    payload
}

fn tagged_line(line: &str) -> bool {
    line.starts_with('A') && line[1..].chars().next().is_some_and(|c| c.is_ascii_digit())
}
