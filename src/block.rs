use serde::Deserialize;

use crate::decoder::{FieldMap, FieldSpec};
use crate::error::{Error, Result};

/// Contiguous run of holding registers read in a single transaction, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    start: u16,
    end: u16,
}

impl RegisterBlock {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if end <= start {
            return Err(Error::Config(format!(
                "block {start}..{end} must end after it starts"
            )));
        }
        Ok(RegisterBlock { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of 16-bit registers covered.
    pub fn len(&self) -> u16 {
        self.end - self.start
    }

    /// Whether `spec` lies entirely within this block.
    pub fn check(&self, spec: &FieldSpec) -> Result<()> {
        let register = spec.register();
        let span = spec.span();
        let last = u32::from(register) + u32::from(span);
        if span == 0 || register < self.start || last > u32::from(self.end) {
            return Err(Error::OutOfRange {
                register,
                span,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// A named register range together with the fields decoded out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub range: RegisterBlock,
    pub fields: FieldMap,
}

impl Block {
    /// Builds a block, rejecting any field that does not fit in the range.
    pub fn new(name: impl Into<String>, start: u16, end: u16, fields: FieldMap) -> Result<Self> {
        let name = name.into();
        let range = RegisterBlock::new(start, end)?;
        for (field, spec) in &fields {
            range.check(spec).map_err(|error| {
                log::error!("Field `{field}` of block `{name}` does not fit: {error}");
                error
            })?;
        }
        Ok(Block {
            name,
            range,
            fields,
        })
    }
}

/// Block as written in the configuration file, validated through [`Block::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    pub name: String,
    pub start: u16,
    pub end: u16,
    #[serde(default)]
    pub fields: FieldMap,
}

impl TryFrom<BlockConfig> for Block {
    type Error = Error;

    fn try_from(config: BlockConfig) -> Result<Self> {
        Block::new(config.name, config.start, config.end, config.fields)
    }
}
