// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Line protocol between git-annex and an external special remote.
// Author: Lukas Bower

//! git-annex external special remote protocol, version 1.
//!
//! git-annex writes one request per line to the remote's stdin and expects
//! one reply per line on stdout. While handling a request the remote may
//! issue its own queries, which git-annex answers with `VALUE` lines.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use log::{debug, warn};

use super::{Annex, SpecialRemote};
use crate::error::{RemakeError, Result};

/// Protocol version announced on startup.
pub const PROTOCOL_VERSION: u32 = 1;

/// A request sent by git-annex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Protocol extensions offered by git-annex.
    Extensions(Vec<String>),
    /// Prepare for transfers.
    Prepare,
    /// Initialise or enable the remote.
    InitRemote,
    /// Fetch the content of a key into a file.
    Retrieve {
        /// Annex key.
        key: String,
        /// Destination path.
        file: PathBuf,
    },
    /// Store the content of a key from a file.
    Store {
        /// Annex key.
        key: String,
        /// Source path.
        file: PathBuf,
    },
    /// Presence check for a key.
    CheckPresent(String),
    /// Drop a key.
    Remove(String),
    /// Ask whether the remote handles a URL.
    ClaimUrl(String),
    /// Ask whether a claimed URL can be downloaded.
    CheckUrl(String),
    /// Ask for the transfer cost.
    GetCost,
    /// Ask whether the remote is local or global.
    GetAvailability,
    /// git-annex reports a fatal error and will stop talking.
    Error(String),
    /// Anything this remote does not implement.
    Unsupported(String),
}

impl Request {
    /// Parse one protocol line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "EXTENSIONS" => Self::Extensions(rest.split_whitespace().map(str::to_owned).collect()),
            "PREPARE" => Self::Prepare,
            "INITREMOTE" => Self::InitRemote,
            "TRANSFER" => {
                let mut fields = rest.splitn(3, ' ');
                match (fields.next(), fields.next(), fields.next()) {
                    (Some("RETRIEVE"), Some(key), Some(file)) if !file.is_empty() => {
                        Self::Retrieve {
                            key: key.to_owned(),
                            file: PathBuf::from(file),
                        }
                    }
                    (Some("STORE"), Some(key), Some(file)) if !file.is_empty() => Self::Store {
                        key: key.to_owned(),
                        file: PathBuf::from(file),
                    },
                    _ => Self::Unsupported(line.to_owned()),
                }
            }
            "CHECKPRESENT" if !rest.is_empty() => Self::CheckPresent(rest.to_owned()),
            "REMOVE" if !rest.is_empty() => Self::Remove(rest.to_owned()),
            "CLAIMURL" if !rest.is_empty() => Self::ClaimUrl(rest.to_owned()),
            "CHECKURL" if !rest.is_empty() => Self::CheckUrl(rest.to_owned()),
            "GETCOST" => Self::GetCost,
            "GETAVAILABILITY" => Self::GetAvailability,
            "ERROR" => Self::Error(rest.to_owned()),
            _ => Self::Unsupported(line.to_owned()),
        }
    }
}

/// Protocol endpoint wrapping git-annex's pipes.
#[derive(Debug)]
pub struct AnnexProtocol<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> AnnexProtocol<R, W> {
    /// Speak the protocol over `input` and `output`.
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Consume the endpoint, returning the output half.
    pub fn into_output(self) -> W {
        self.output
    }

    /// Announce the protocol version and answer requests until git-annex
    /// closes the pipe.
    ///
    /// A failed request is reported to git-annex and the loop carries on.
    pub fn serve(&mut self, remote: &mut dyn SpecialRemote) -> Result<()> {
        self.send(&format!("VERSION {PROTOCOL_VERSION}"))?;
        while let Some(line) = self.read_line()? {
            if line.is_empty() {
                continue;
            }
            let request = Request::parse(&line);
            if let Request::Error(message) = &request {
                return Err(RemakeError::Protocol(format!("git-annex reported: {message}")));
            }
            let reply = self.dispatch(remote, request);
            self.send(&reply)?;
        }
        debug!("git-annex closed the protocol stream");
        Ok(())
    }

    fn dispatch(&mut self, remote: &mut dyn SpecialRemote, request: Request) -> String {
        match request {
            Request::Extensions(offered) => {
                debug!("git-annex offers extensions {offered:?}");
                "EXTENSIONS".to_owned()
            }
            Request::Prepare => match remote.prepare(self) {
                Ok(()) => "PREPARE-SUCCESS".to_owned(),
                Err(err) => format!("PREPARE-FAILURE {}", one_line(&err.to_string())),
            },
            Request::InitRemote => match remote.initremote(self) {
                Ok(()) => "INITREMOTE-SUCCESS".to_owned(),
                Err(err) => format!("INITREMOTE-FAILURE {}", one_line(&err.to_string())),
            },
            Request::Retrieve { key, file } => {
                match remote.transfer_retrieve(self, &key, &file) {
                    Ok(()) => format!("TRANSFER-SUCCESS RETRIEVE {key}"),
                    Err(err) => {
                        format!("TRANSFER-FAILURE RETRIEVE {key} {}", one_line(&err.to_string()))
                    }
                }
            }
            Request::Store { key, file } => match remote.transfer_store(self, &key, &file) {
                Ok(()) => format!("TRANSFER-SUCCESS STORE {key}"),
                Err(err) => format!("TRANSFER-FAILURE STORE {key} {}", one_line(&err.to_string())),
            },
            Request::CheckPresent(key) => match remote.checkpresent(self, &key) {
                Ok(true) => format!("CHECKPRESENT-SUCCESS {key}"),
                Ok(false) => format!("CHECKPRESENT-FAILURE {key}"),
                Err(err) => format!("CHECKPRESENT-UNKNOWN {key} {}", one_line(&err.to_string())),
            },
            Request::Remove(key) => match remote.remove(self, &key) {
                Ok(()) => format!("REMOVE-SUCCESS {key}"),
                Err(err) => format!("REMOVE-FAILURE {key} {}", one_line(&err.to_string())),
            },
            Request::ClaimUrl(url) => {
                if remote.claimurl(self, &url) {
                    "CLAIMURL-SUCCESS".to_owned()
                } else {
                    "CLAIMURL-FAILURE".to_owned()
                }
            }
            Request::CheckUrl(url) => {
                if remote.checkurl(self, &url) {
                    "CHECKURL-CONTENTS UNKNOWN".to_owned()
                } else {
                    "CHECKURL-FAILURE".to_owned()
                }
            }
            Request::GetCost => format!("COST {}", remote.cost()),
            Request::GetAvailability => "AVAILABILITY LOCAL".to_owned(),
            Request::Error(_) | Request::Unsupported(_) => "UNSUPPORTED-REQUEST".to_owned(),
        }
    }

    fn send(&mut self, line: &str) -> Result<()> {
        debug!("-> {line}");
        writeln!(self.output, "{line}")
            .and_then(|()| self.output.flush())
            .map_err(|err| RemakeError::io("write to git-annex", err))
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .map_err(|err| RemakeError::io("read from git-annex", err))?;
        if read == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n').to_owned();
        debug!("<- {line}");
        Ok(Some(line))
    }

    fn read_value(&mut self) -> Result<String> {
        let line = self.read_line()?.ok_or_else(|| {
            RemakeError::Protocol("stream closed while waiting for VALUE".to_owned())
        })?;
        if line == "VALUE" {
            return Ok(String::new());
        }
        line.strip_prefix("VALUE ")
            .map(str::to_owned)
            .ok_or_else(|| RemakeError::Protocol(format!("expected VALUE, got {line:?}")))
    }
}

impl<R: BufRead, W: Write> Annex for AnnexProtocol<R, W> {
    fn get_urls(&mut self, key: &str, prefix: &str) -> Result<Vec<String>> {
        self.send(&format!("GETURLS {key} {prefix}"))?;
        let mut urls = Vec::new();
        loop {
            let value = self.read_value()?;
            if value.is_empty() {
                return Ok(urls);
            }
            urls.push(value);
        }
    }

    fn git_dir(&mut self) -> Result<PathBuf> {
        self.send("GETGITDIR")?;
        let value = self.read_value()?;
        if value.is_empty() {
            return Err(RemakeError::Protocol("git-annex returned an empty git dir".to_owned()));
        }
        Ok(PathBuf::from(value))
    }

    fn debug(&mut self, message: &str) {
        if let Err(err) = self.send(&format!("DEBUG {}", one_line(message))) {
            warn!("cannot forward debug message: {err}");
        }
    }
}

/// Collapse a message onto one protocol line.
#[must_use]
pub fn one_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}
