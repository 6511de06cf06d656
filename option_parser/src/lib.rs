// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parser for `key=value,key=value` option strings.
//!
//! Values may be double-quoted to carry commas; a doubled quote outside a
//! quoted run stands for a literal quote.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

mod private_trait {
    // Dispatches to `FromStr::from_str` on externally-defined types and to
    // custom parsing code for types in this module.
    pub trait Parseable
    where
        Self: Sized,
    {
        type Err;
        fn from_str(input: &str) -> Result<Self, <Self as Parseable>::Err>;
    }
}
use private_trait::Parseable;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, OptionParserValue>,
}

struct OptionParserValue {
    value: Option<String>,
    requires_value: bool,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
    #[error("missing option: {0}")]
    MissingOption(String),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                list.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    list.push(current);

    if in_quotes {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

fn dequote(s: &str) -> String {
    let mut prev = '\0';
    let mut in_quotes = false;
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '"' {
            if prev == '"' && !in_quotes {
                out.push('"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(c);
        }
        prev = c;
    }
    out
}

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (option.as_str(), None),
            };
            let Some(entry) = self.options.get_mut(name) else {
                return Err(OptionParserError::UnknownOption(name.to_owned()));
            };

            entry.value = match (entry.requires_value, value) {
                (true, Some(value)) => Some(value.trim().to_owned()),
                (true, None) => return Err(OptionParserError::InvalidSyntax(option.to_owned())),
                (false, _) => Some(String::new()),
            };
        }

        Ok(())
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.contains(['"', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(
            option.to_owned(),
            OptionParserValue {
                value: None,
                requires_value: true,
            },
        );

        self
    }

    pub fn add_valueless(&mut self, option: &str) -> &mut Self {
        self.options.insert(
            option.to_owned(),
            OptionParserValue {
                value: None,
                requires_value: false,
            },
        );

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.value.as_deref())
            .filter(|s| !s.is_empty())
            .map(dequote)
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options
            .get(option)
            .and_then(|v| v.value.as_ref())
            .is_some()
    }

    pub fn convert<T: Parseable>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.options.get(option).and_then(|v| v.value.as_ref()) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => Parseable::from_str(v)
                .map(Some)
                .map_err(|_| OptionParserError::Conversion(option.to_owned(), v.to_owned())),
        }
    }

    /// Like [`OptionParser::convert`], but the option must have a value.
    pub fn convert_required<T: Parseable>(&self, option: &str) -> OptionParserResult<T> {
        self.convert(option)?
            .ok_or_else(|| OptionParserError::MissingOption(option.to_owned()))
    }
}

#[derive(Debug)]
pub struct Toggle(pub bool);

#[derive(Error, Debug)]
pub enum ToggleParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Parseable for Toggle {
    type Err = ToggleParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "off" | "false" => Ok(Toggle(false)),
            "on" | "true" => Ok(Toggle(true)),
            _ => Err(ToggleParseError::InvalidValue(s.to_owned())),
        }
    }
}

/// A byte count with an optional binary suffix: K, M, G or T.
pub struct ByteSized(pub u64);

#[derive(Error, Debug)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("value too large: {0}")]
    Overflow(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, shift) = match s.char_indices().last() {
            Some((i, 'K')) => (&s[..i], 10),
            Some((i, 'M')) => (&s[..i], 20),
            Some((i, 'G')) => (&s[..i], 30),
            Some((i, 'T')) => (&s[..i], 40),
            _ => (s, 0),
        };

        let value = digits
            .parse::<u64>()
            .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?;
        value
            .checked_mul(1 << shift)
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::Overflow(s.to_owned()))
    }
}

impl<T> Parseable for T
where
    T: FromStr + Sized,
{
    type Err = <T as FromStr>::Err;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        dequote(s).parse()
    }
}
