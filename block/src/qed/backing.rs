// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::header::BackingFormat;
use super::{Error, QedConfig, QedImage, Result};
use crate::raw_sync::read_at_zero_filled;
use crate::{detect_image_type, ImageType};

/// Read access to the parent of an image. Reads beyond the end of the
/// parent return zeros.
pub trait BackingRead: Send {
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Size of the parent's virtual disk.
    fn virtual_size(&self) -> u64;
}

/// A raw file used as backing image.
pub struct RawBacking {
    file: File,
    size: u64,
}

impl RawBacking {
    pub fn new(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(RawBacking { file, size })
    }
}

impl BackingRead for RawBacking {
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        read_at_zero_filled(&self.file, buf, address).map(|_| ())
    }

    fn virtual_size(&self) -> u64 {
        self.size
    }
}

impl BackingRead for QedImage {
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        let len = self
            .image_size()
            .saturating_sub(address)
            .min(buf.len() as u64) as usize;
        if len > 0 {
            QedImage::read_at(self, address, &mut buf[..len]).map_err(io::Error::other)?;
        }
        buf[len..].fill(0);
        Ok(())
    }

    fn virtual_size(&self) -> u64 {
        self.image_size()
    }
}

fn backing_path(image_path: &Path, name: &str) -> PathBuf {
    match image_path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Opens the backing image `name` of the image at `image_path`, read-only.
/// Without an explicit format the file is probed.
pub(super) fn open_backing(
    image_path: &Path,
    name: &str,
    format: Option<BackingFormat>,
    config: &QedConfig,
) -> Result<Box<dyn BackingRead>> {
    if config.max_nesting_depth == 0 {
        return Err(Error::MaxNestingDepthExceeded);
    }

    let path = backing_path(image_path, name);
    let file = OpenOptions::new()
        .read(true)
        .open(&path)
        .map_err(Error::BackingFileIo)?;

    let format = match format {
        Some(format) => format,
        None => match detect_image_type(&file).map_err(Error::BackingFileIo)? {
            ImageType::Qed => BackingFormat::Qed,
            ImageType::Raw => BackingFormat::Raw,
        },
    };
    debug!("Opening {format} backing file {}", path.display());

    match format {
        BackingFormat::Raw => Ok(Box::new(
            RawBacking::new(file).map_err(Error::BackingFileIo)?,
        )),
        BackingFormat::Qed => {
            let config = QedConfig {
                read_only: true,
                max_nesting_depth: config.max_nesting_depth - 1,
                ..config.clone()
            };
            let image = QedImage::open_file(file, &path, &config)
                .map_err(|e| Error::BackingFileOpen(Box::new(e)))?;
            Ok(Box::new(image))
        }
    }
}
