// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use block::qed::header::BackingFormat;
use block::qed::{CreateOptions, QedConfig};
use option_parser::{ByteSized, OptionParser, OptionParserError, Toggle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error parsing --open")]
    ParseOpen(#[source] OptionParserError),
    #[error("Error parsing create options")]
    ParseCreate(#[source] OptionParserError),
    #[error("Image size is required")]
    ParseCreateSizeMissing,
    #[error("Invalid backing format: {0}")]
    ParseBackingFormat(String),
    #[error("backing_fmt requires backing_file")]
    ParseBackingFormatWithoutFile,
}

pub type Result<T> = std::result::Result<T, Error>;

pub const CREATE_SYNTAX: &str = "Image creation parameters \
\"size=<bytes>[K|M|G|T],cluster_size=<bytes>,table_size=<clusters>,\
backing_file=<path>,backing_fmt=raw|qed\"";

pub const OPEN_SYNTAX: &str = "Image open parameters \
\"readonly=on|off,l2_cache_size=<tables>\"";

pub struct CreateConfig;

impl CreateConfig {
    pub fn parse(create: &str) -> Result<CreateOptions> {
        let mut parser = OptionParser::new();
        parser
            .add("size")
            .add("cluster_size")
            .add("table_size")
            .add("backing_file")
            .add("backing_fmt");
        parser.parse(create).map_err(Error::ParseCreate)?;

        let defaults = CreateOptions::default();
        let size = parser
            .convert::<ByteSized>("size")
            .map_err(Error::ParseCreate)?
            .ok_or(Error::ParseCreateSizeMissing)?
            .0;
        let cluster_size = parser
            .convert::<ByteSized>("cluster_size")
            .map_err(Error::ParseCreate)?
            .map_or(u64::from(defaults.cluster_size), |v| v.0);
        let cluster_size = u32::try_from(cluster_size).map_err(|_| {
            Error::ParseCreate(OptionParserError::Conversion(
                "cluster_size".to_owned(),
                cluster_size.to_string(),
            ))
        })?;
        let table_size = parser
            .convert("table_size")
            .map_err(Error::ParseCreate)?
            .unwrap_or(defaults.table_size);
        let backing_file = parser.get("backing_file");
        let backing_format = parser
            .get("backing_fmt")
            .map(|fmt| {
                fmt.parse::<BackingFormat>()
                    .map_err(|_| Error::ParseBackingFormat(fmt))
            })
            .transpose()?;
        if backing_format.is_some() && backing_file.is_none() {
            return Err(Error::ParseBackingFormatWithoutFile);
        }

        Ok(CreateOptions {
            size,
            cluster_size,
            table_size,
            backing_file,
            backing_format,
        })
    }
}

pub struct OpenConfig;

impl OpenConfig {
    /// Builds the open-time configuration, starting from `read_only`.
    pub fn parse(open: &str, read_only: bool) -> Result<QedConfig> {
        let mut parser = OptionParser::new();
        parser.add("readonly").add("l2_cache_size");
        parser.parse(open).map_err(Error::ParseOpen)?;

        let defaults = QedConfig::default();
        let read_only = parser
            .convert::<Toggle>("readonly")
            .map_err(Error::ParseOpen)?
            .map_or(read_only, |toggle| toggle.0);
        let l2_cache_size = parser
            .convert("l2_cache_size")
            .map_err(Error::ParseOpen)?
            .unwrap_or(defaults.l2_cache_size);

        Ok(QedConfig {
            read_only,
            l2_cache_size,
            ..defaults
        })
    }
}
