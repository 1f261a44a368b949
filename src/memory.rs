// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module defines the view of application memory

use crate::error::MangleError;
use std::fmt;

/// One mapped span of application code
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CodeRegion<'a> {
    /// Application virtual address of the first byte
    pub app_addr: u64,
    /// The mapped bytes
    pub bytes: &'a [u8],
}

impl<'a> CodeRegion<'a> {
    /// Creates a new CodeRegion covering `bytes` at `app_addr`
    pub fn new(bytes: &'a [u8], app_addr: u64) -> Self {
        CodeRegion { app_addr, bytes }
    }

    fn contains(&self, app_addr: u64) -> bool {
        app_addr >= self.app_addr && app_addr - self.app_addr < self.bytes.len() as u64
    }
}

impl fmt::Debug for CodeRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "app_addr: {:#x?}-{:#x?}, len: {}",
            self.app_addr,
            self.app_addr + self.bytes.len() as u64,
            self.bytes.len()
        )
    }
}

impl std::cmp::PartialOrd for CodeRegion<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::Ord for CodeRegion<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.app_addr.cmp(&other.app_addr)
    }
}

/// Read-only map from application addresses to byte slices
#[derive(Debug)]
pub struct AppMemory<'a> {
    /// Mapped code regions, sorted by application address
    regions: Box<[CodeRegion<'a>]>,
}

impl<'a> AppMemory<'a> {
    /// Creates a new AppMemory structure from the given regions
    pub fn new(mut regions: Vec<CodeRegion<'a>>) -> Result<Self, MangleError> {
        regions.sort();
        for index in 1..regions.len() {
            let prev = &regions[index - 1];
            if prev.app_addr + prev.bytes.len() as u64 > regions[index].app_addr {
                return Err(MangleError::InvalidCodeRegion(index));
            }
        }
        Ok(Self {
            regions: regions.into_boxed_slice(),
        })
    }

    /// Bytes starting at `app_addr`, at most `max_len` long, truncated at the
    /// containing region's end
    pub fn slice_at(&self, app_addr: u64, max_len: usize) -> Result<&'a [u8], MangleError> {
        let index = self
            .regions
            .partition_point(|region| region.app_addr <= app_addr);
        if index == 0 {
            return Err(MangleError::UnmappedAddress(app_addr));
        }
        let region = &self.regions[index - 1];
        if !region.contains(app_addr) {
            return Err(MangleError::UnmappedAddress(app_addr));
        }
        let offset = (app_addr - region.app_addr) as usize;
        let end = region.bytes.len().min(offset + max_len);
        Ok(&region.bytes[offset..end])
    }
}
