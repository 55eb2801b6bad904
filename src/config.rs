//! Daemon configuration.
//!
//! The configuration is loaded once at start-up from a JSON document and is
//! immutable thereafter; a borrowed reference is passed into the
//! constructors that need it.
//!
//! A model entry looks like the following:
//!
//! ```json
//! {
//!     "name": "EC05x",
//!     "manufacturer": "Ruwido",
//!     "oui": "1C:A2:B1",
//!     "pairingNameFormat": "U%03hhu*",
//!     "scanNameFormat": "U*",
//!     "filterBytes": [ 32 ],
//!     "connectionParams": {
//!         "minInterval": 15.0,
//!         "maxInterval": 15.0,
//!         "latency": 332,
//!         "supervisionTimeout": 15000
//!     },
//!     "services": {
//!         "type": "dbus",
//!         "supported": [ "audio", "battery", "deviceInfo", "findMe", "infrared", "touch" ]
//!     }
//! }
//! ```

use serde::Deserialize;
use std::{path::Path, time::Duration};

use crate::{ConnectionParameters, Error, ErrorKind, InternalErrorKind, Result};

/// Phase timeouts, all in milliseconds in the configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// Discovery phase timeout.
    pub discovery: u64,
    /// Pairing phase timeout.
    pub pair: u64,
    /// Setup phase timeout.
    pub setup: u64,
    /// Un-pairing phase timeout.
    pub unpair: u64,
    /// Poll interval while waiting for a hidraw device node.
    pub hidraw_poll: u64,
    /// Upper limit on waiting for a hidraw device node.
    pub hidraw_limit: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { discovery: 15_000, pair: 15_000, setup: 60_000, unpair: 20_000, hidraw_poll: 20_000, hidraw_limit: 65_000 }
    }
}

impl Timeouts {
    /// Discovery timeout as a [Duration].
    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery)
    }

    /// Pairing timeout as a [Duration].
    pub fn pair(&self) -> Duration {
        Duration::from_millis(self.pair)
    }

    /// Setup timeout as a [Duration].
    pub fn setup(&self) -> Duration {
        Duration::from_millis(self.setup)
    }

    /// Un-pairing timeout as a [Duration].
    pub fn unpair(&self) -> Duration {
        Duration::from_millis(self.unpair)
    }
}

/// Service exposure type of a model.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicesType {
    /// Services are proxied from a vendor daemon over D-Bus.
    DBus,
    /// Services are consumed directly over GATT.
    Gatt,
}

/// A service an RCU model may support.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Service {
    /// Voice audio streaming.
    Audio,
    /// Battery level reporting.
    Battery,
    /// Device information strings.
    DeviceInfo,
    /// Find-me beeper.
    FindMe,
    /// Infrared programming.
    Infrared,
    /// Touch pad input.
    Touch,
    /// Firmware upgrade.
    Upgrade,
}

/// Services block of a model entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesConfig {
    /// How the services of this model are consumed.
    #[serde(rename = "type")]
    pub services_type: ServicesType,
    /// The services the model supports.
    #[serde(default)]
    pub supported: Vec<Service>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self { services_type: ServicesType::DBus, supported: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConnectionParams {
    #[serde(rename = "minInterval")]
    min_interval: f64,
    #[serde(rename = "maxInterval")]
    max_interval: f64,
    latency: u16,
    #[serde(rename = "supervisionTimeout")]
    supervision_timeout: u32,
}

/// Per-RCU-model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Model name.
    pub name: String,
    /// Manufacturer name.
    #[serde(default)]
    pub manufacturer: String,
    /// The OUI of the model in `AA:BB:CC` form.
    #[serde(deserialize_with = "deserialize_oui")]
    pub oui: u32,
    /// Whether this model entry is ignored.
    #[serde(default)]
    pub disabled: bool,
    /// printf style pattern with a single byte slot, producing the shell
    /// wildcard that the name of a device advertising a given pairing code
    /// matches.
    pub pairing_name_format: String,
    /// Shell wildcard matching the name of any device of this model in
    /// pairing mode.
    pub scan_name_format: String,
    /// IR filter bytes accepted for this model.
    #[serde(default)]
    pub filter_bytes: Vec<u8>,
    /// Services the model exposes.
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    connection_params: Option<RawConnectionParams>,
}

impl ModelConfig {
    /// The desired connection parameters for links to devices of this
    /// model, if any are configured.
    pub fn connection_params(&self) -> Option<ConnectionParameters> {
        self.connection_params.as_ref().map(|raw| {
            ConnectionParameters::new(raw.min_interval, raw.max_interval, raw.latency, raw.supervision_timeout)
        })
    }

    /// Matcher for the name of any device of this model in pairing mode,
    /// regardless of pairing code.
    pub fn scan_matcher(&self) -> Option<regex::Regex> {
        wildcard_matcher(&self.scan_name_format)
    }
}

/// Expands the single `%hhu` byte slot (with optional zero padding and
/// width, e.g. `%03hhu`) of a pairing name format.
pub(crate) fn expand_name_format(format: &str, code: u8) -> String {
    let mut out = String::with_capacity(format.len() + 3);
    let mut rest = format;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(after) = rest.strip_prefix('%') {
            out.push('%');
            rest = after;
            continue;
        }

        let spec_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let (spec, after) = rest.split_at(spec_len);
        if let Some(after) =
            after.strip_prefix("hhu").or_else(|| after.strip_prefix("hu")).or_else(|| after.strip_prefix('u'))
        {
            let width: usize = spec.parse().unwrap_or(0);
            if spec.starts_with('0') {
                out.push_str(&format!("{code:0width$}"));
            } else if width > 0 {
                out.push_str(&format!("{code:width$}"));
            } else {
                out.push_str(&code.to_string());
            }
            rest = after;
        } else {
            // not a byte slot, keep the literal text
            out.push('%');
        }
    }

    out.push_str(rest);
    out
}

/// Compiles a case-insensitive shell wildcard pattern (`*` and `?`) into
/// an anchored regular expression.
pub(crate) fn wildcard_matcher(pattern: &str) -> Option<regex::Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            ch => expr.push_str(&regex::escape(&ch.to_string())),
        }
    }
    expr.push('$');

    match regex::Regex::new(&expr) {
        Ok(re) => Some(re),
        Err(err) => {
            log::warn!("invalid name pattern '{pattern}': {err}");
            None
        }
    }
}

fn deserialize_oui<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let s = String::deserialize(deserializer)?;
    parse_oui(&s).ok_or_else(|| D::Error::custom(format!("invalid 'oui' field: {s}")))
}

fn parse_oui(s: &str) -> Option<u32> {
    let fields: Vec<&str> = s.split(':').collect();
    if fields.len() != 3 || fields.iter().any(|f| f.len() != 2) {
        return None;
    }
    let mut oui = 0u32;
    for field in fields {
        oui = (oui << 8) | u32::from(u8::from_str_radix(field, 16).ok()?);
    }
    Some(oui)
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Phase timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Known RCU models.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl Config {
    /// Loads the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_slice(&data)
    }

    /// Parses the configuration from a JSON document.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let config: Config = serde_json::from_slice(data).map_err(|err| {
            Error::with_message(ErrorKind::Internal(InternalErrorKind::InvalidValue), err.to_string())
        })?;

        for model in &config.models {
            let services: Vec<String> = model.services.supported.iter().map(ToString::to_string).collect();
            log::info!(
                "loaded model {} ({}) with services [{}]{}",
                model.name,
                model.manufacturer,
                services.join(", "),
                if model.disabled { " [disabled]" } else { "" }
            );
        }

        Ok(config)
    }

    /// The model entries that are not disabled.
    pub fn enabled_models(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.iter().filter(|m| !m.disabled)
    }
}
