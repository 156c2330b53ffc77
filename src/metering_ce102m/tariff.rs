//! Tariff band selection. The meter addresses tariff registers either as a
//! summary (no selector), a single band, or a contiguous `start,count`
//! window, so a sparse request keeps the full window on the wire and the
//! mask filters on emit.

use super::ConfigError;

pub const MAX_TARIFF_ID: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TariffFilter {
    All,
    Single {
        id: u8,
        arg: String,
    },
    Range {
        min: u8,
        mask: [bool; MAX_TARIFF_ID],
        arg: String,
    },
}

impl TariffFilter {
    pub fn build(requested: &[u8]) -> Result<Self, ConfigError> {
        if requested.is_empty() {
            return Ok(TariffFilter::All);
        }

        let mut ids = requested.to_vec();
        ids.sort_unstable();

        let mut mask = [false; MAX_TARIFF_ID];
        for &id in &ids {
            if id == 0 || id as usize > MAX_TARIFF_ID {
                return Err(ConfigError::InvalidTariff(id));
            }
            mask[id as usize - 1] = true;
        }

        let min = ids[0];
        let max = ids[ids.len() - 1];
        if min == max {
            return Ok(TariffFilter::Single {
                id: min,
                arg: min.to_string(),
            });
        }

        if mask.iter().all(|&selected| selected) {
            return Ok(TariffFilter::All);
        }

        Ok(TariffFilter::Range {
            min,
            mask,
            arg: format!("{},{}", min, max - min + 1),
        })
    }

    /// Protocol selector suffix, absent for the all-tariff summary.
    pub fn wire_arg(&self) -> Option<&str> {
        match self {
            TariffFilter::All => None,
            TariffFilter::Single { arg, .. } | TariffFilter::Range { arg, .. } => Some(arg),
        }
    }
}
