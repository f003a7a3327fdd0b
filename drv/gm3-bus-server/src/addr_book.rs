// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence of the gateway's claimed bus address.
//!
//! The claimed address is the only state this gateway persists: one
//! ASCII decimal line in `<state_dir>/paired_address`, written exactly
//! once per successful auto-claim via tempfile-and-rename so a crash
//! never leaves a torn file.

use std::io::Write;
use std::path::PathBuf;

use drv_gm3_proto::is_reserved_addr;

#[derive(Debug)]
pub enum ClaimError {
    /// The address is in the reserved set and must never be ours.
    Reserved(u16),
    /// The state directory or file could not be written.
    Io(std::io::Error),
}

impl core::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Reserved(addr) => {
                write!(f, "address {addr} is reserved")
            }
            Self::Io(e) => write!(f, "cannot persist claimed address: {e}"),
        }
    }
}

impl std::error::Error for ClaimError {}

pub struct AddrBook {
    path: PathBuf,
    claimed: Option<u16>,
}

impl AddrBook {
    /// Loads any previously claimed address. A missing file means the
    /// gateway is unregistered; a malformed file is treated the same
    /// way (and logged), leaving re-registration to sort it out.
    pub fn load(path: PathBuf) -> Self {
        let claimed = match std::fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<u16>() {
                Ok(addr) => {
                    log::info!("loaded claimed address {addr}");
                    Some(addr)
                }
                Err(_) => {
                    log::warn!(
                        "ignoring malformed {}: {text:?}",
                        path.display()
                    );
                    None
                }
            },
            Err(_) => None,
        };
        Self { path, claimed }
    }

    pub fn claimed(&self) -> Option<u16> {
        self.claimed
    }

    /// Records a successful auto-claim. Reserved addresses are refused
    /// before anything touches the filesystem.
    pub fn claim(&mut self, addr: u16) -> Result<(), ClaimError> {
        if is_reserved_addr(addr) {
            return Err(ClaimError::Reserved(addr));
        }
        let dir = self.path.parent().unwrap_or(std::path::Path::new("."));
        std::fs::create_dir_all(dir).map_err(ClaimError::Io)?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(ClaimError::Io)?;
        writeln!(tmp, "{addr}").map_err(ClaimError::Io)?;
        tmp.persist(&self.path)
            .map_err(|e| ClaimError::Io(e.error))?;
        self.claimed = Some(addr);
        log::info!("claimed bus address {addr}");
        Ok(())
    }
}
