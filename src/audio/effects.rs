use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::MusicError;

/// Ajustes de filtros de audio de un guild.
///
/// The well-known keys are typed; anything else a front-end sends is kept in
/// `extra` and handed to the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bassboost: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nightcore: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vaporwave: Option<bool>,
    #[serde(rename = "8d", default, skip_serializing_if = "Option::is_none")]
    pub eight_d: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distortion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowpass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channelmix: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescale: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AudioFilters {
    /// True when nothing is set, i.e. the engine's own default.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Presets de filtros disponibles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPreset {
    BassBoost,
    Nightcore,
    Vaporwave,
    EightD,
    Reset,
}

impl FilterPreset {
    pub const ALL: [FilterPreset; 5] = [
        FilterPreset::BassBoost,
        FilterPreset::Nightcore,
        FilterPreset::Vaporwave,
        FilterPreset::EightD,
        FilterPreset::Reset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterPreset::BassBoost => "bassboost",
            FilterPreset::Nightcore => "nightcore",
            FilterPreset::Vaporwave => "vaporwave",
            FilterPreset::EightD => "8d",
            FilterPreset::Reset => "reset",
        }
    }

    /// Resuelve el preset a su conjunto de filtros
    pub fn filters(self) -> AudioFilters {
        match self {
            FilterPreset::BassBoost => AudioFilters {
                bassboost: Some(0.5),
                ..Default::default()
            },
            FilterPreset::Nightcore => AudioFilters {
                nightcore: Some(true),
                ..Default::default()
            },
            FilterPreset::Vaporwave => AudioFilters {
                vaporwave: Some(true),
                ..Default::default()
            },
            FilterPreset::EightD => AudioFilters {
                eight_d: Some(true),
                ..Default::default()
            },
            FilterPreset::Reset => AudioFilters::default(),
        }
    }
}

impl FromStr for FilterPreset {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FilterPreset::ALL
            .into_iter()
            .find(|preset| preset.name() == wanted)
            .ok_or_else(|| MusicError::UnknownPreset(s.to_string()))
    }
}

impl fmt::Display for FilterPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
