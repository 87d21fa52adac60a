// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Scan targets and the entry messages injected for them.
//!
//! Every asset resolves to one or more [`AssetMessage`]s, each carrying a
//! content-derived [`AssetId`] so that re-submitting the same target within a
//! scan can be recognised and skipped.

use crate::domain::selector::well_known;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("Asset input must name exactly one target, got {0}")]
    TargetCount(usize),

    #[error("Invalid network address '{0}'")]
    InvalidAddress(String),

    #[error("Invalid network mask '{mask}' for {address}")]
    InvalidMask { address: String, mask: String },

    #[error("Unknown asset kind '{0}'")]
    UnknownKind(String),

    #[error("Asset value cannot be empty")]
    EmptyValue,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// IP address with optional prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpNetwork {
    pub address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u8>,
}

impl IpNetwork {
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

impl FromStr for IpNetwork {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, mask) = match s.split_once('/') {
            Some((addr, mask)) => (addr, Some(mask)),
            None => (s, None),
        };
        let address: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| AssetError::InvalidAddress(s.to_string()))?;
        let max_mask = if address.is_ipv4() { 32 } else { 128 };
        let mask = mask
            .map(|m| {
                m.trim()
                    .parse::<u8>()
                    .ok()
                    .filter(|m| *m <= max_mask)
                    .ok_or_else(|| AssetError::InvalidMask {
                        address: addr.to_string(),
                        mask: m.to_string(),
                    })
            })
            .transpose()?;
        Ok(Self { address, mask })
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mask {
            Some(mask) => write!(f, "{}/{}", self.address, mask),
            None => write!(f, "{}", self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Asset {
    Network { networks: Vec<IpNetwork> },
    Link { url: String, method: String },
    AndroidStore { package_name: String },
    IosStore { bundle_id: String },
    AndroidFile { path: String },
    IosFile { path: String },
}

/// Payload published on an asset entry selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMessage {
    pub asset_id: AssetId,
    pub asset: Asset,
}

/// Raw asset input as submitted by a caller: exactly one field must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetInput {
    #[serde(default)]
    pub ip: Vec<String>,
    pub link: Option<String>,
    pub android_store: Option<String>,
    pub ios_store: Option<String>,
    pub android_file: Option<String>,
    pub ios_file: Option<String>,
}

impl AssetInput {
    pub fn into_asset(self) -> Result<Asset, AssetError> {
        let targets = usize::from(!self.ip.is_empty())
            + [
                &self.link,
                &self.android_store,
                &self.ios_store,
                &self.android_file,
                &self.ios_file,
            ]
            .iter()
            .filter(|t| t.is_some())
            .count();
        if targets != 1 {
            return Err(AssetError::TargetCount(targets));
        }

        if !self.ip.is_empty() {
            let networks = self
                .ip
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse())
                .collect::<Result<Vec<IpNetwork>, _>>()?;
            let asset = Asset::Network { networks };
            asset.validate()?;
            return Ok(asset);
        }
        if let Some(url) = self.link {
            return Asset::link(&url);
        }
        if let Some(package_name) = self.android_store {
            return Ok(Asset::AndroidStore { package_name });
        }
        if let Some(bundle_id) = self.ios_store {
            return Ok(Asset::IosStore { bundle_id });
        }
        if let Some(path) = self.android_file {
            return Ok(Asset::AndroidFile { path });
        }
        match self.ios_file {
            Some(path) => Ok(Asset::IosFile { path }),
            None => Err(AssetError::TargetCount(0)),
        }
    }
}

impl Asset {
    /// Reject assets that would publish no entry message at all.
    pub fn validate(&self) -> Result<(), AssetError> {
        match self {
            Asset::Network { networks } if networks.is_empty() => Err(AssetError::EmptyValue),
            Asset::Link { url, .. } if url.trim().is_empty() => Err(AssetError::EmptyValue),
            _ => Ok(()),
        }
    }

    pub fn link(url: &str) -> Result<Self, AssetError> {
        if url.trim().is_empty() {
            return Err(AssetError::EmptyValue);
        }
        Ok(Asset::Link {
            url: url.trim().to_string(),
            method: "GET".to_string(),
        })
    }

    /// Parse the `kind:value` short form, e.g. `ip:10.0.0.0/24,10.0.1.1`
    /// or `link:https://example.com`.
    pub fn parse_short(raw: &str) -> Result<Self, AssetError> {
        let (kind, value) = raw
            .split_once(':')
            .ok_or_else(|| AssetError::UnknownKind(raw.to_string()))?;
        if value.trim().is_empty() {
            return Err(AssetError::EmptyValue);
        }
        let mut input = AssetInput::default();
        match kind {
            "ip" => input.ip = value.split(',').map(str::to_string).collect(),
            "link" => input.link = Some(value.to_string()),
            "android-store" => input.android_store = Some(value.to_string()),
            "ios-store" => input.ios_store = Some(value.to_string()),
            "android-file" => input.android_file = Some(value.to_string()),
            "ios-file" => input.ios_file = Some(value.to_string()),
            other => return Err(AssetError::UnknownKind(other.to_string())),
        }
        input.into_asset()
    }

    /// Entry messages for this asset, paired with their unscoped entry selector.
    /// A network asset yields one message per address.
    pub fn messages(&self) -> Vec<(&'static str, AssetMessage)> {
        let (selector, id) = match self {
            Asset::Network { networks } => {
                return networks
                    .iter()
                    .map(|net| {
                        let selector = if net.is_ipv4() {
                            well_known::ASSET_IP_V4
                        } else {
                            well_known::ASSET_IP_V6
                        };
                        let message = AssetMessage {
                            asset_id: AssetId(format!("ip:{}", net)),
                            asset: Asset::Network {
                                networks: vec![*net],
                            },
                        };
                        (selector, message)
                    })
                    .collect();
            }
            Asset::Link { url, method } => {
                (well_known::ASSET_LINK, format!("link:{} {}", method, url))
            }
            Asset::AndroidStore { package_name } => (
                well_known::ASSET_STORE_ANDROID,
                format!("android-store:{}", package_name),
            ),
            Asset::IosStore { bundle_id } => {
                (well_known::ASSET_STORE_IOS, format!("ios-store:{}", bundle_id))
            }
            Asset::AndroidFile { path } => {
                (well_known::ASSET_FILE_ANDROID, format!("android-file:{}", path))
            }
            Asset::IosFile { path } => (well_known::ASSET_FILE_IOS, format!("ios-file:{}", path)),
        };
        vec![(
            selector,
            AssetMessage {
                asset_id: AssetId(id),
                asset: self.clone(),
            },
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_asset_expands_per_address() {
        let asset = Asset::parse_short("ip:10.0.0.0/24,2001:db8::1").unwrap();
        let messages = asset.messages();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, well_known::ASSET_IP_V4);
        assert_eq!(messages[0].1.asset_id.as_str(), "ip:10.0.0.0/24");
        assert_eq!(messages[1].0, well_known::ASSET_IP_V6);
    }

    #[test]
    fn test_invalid_network_rejected() {
        assert!(matches!(
            Asset::parse_short("ip:10.0.0.300"),
            Err(AssetError::InvalidAddress(_))
        ));
        assert!(matches!(
            Asset::parse_short("ip:10.0.0.0/33"),
            Err(AssetError::InvalidMask { .. })
        ));
    }

    #[test]
    fn test_input_requires_exactly_one_target() {
        let none = AssetInput::default();
        assert_eq!(none.into_asset(), Err(AssetError::TargetCount(0)));

        let two = AssetInput {
            link: Some("https://example.com".into()),
            android_store: Some("com.example".into()),
            ..Default::default()
        };
        assert_eq!(two.into_asset(), Err(AssetError::TargetCount(2)));
    }

    #[test]
    fn test_network_without_addresses_rejected() {
        let blank = AssetInput {
            ip: vec![" ".into(), String::new()],
            ..Default::default()
        };
        assert_eq!(blank.into_asset(), Err(AssetError::EmptyValue));
        assert_eq!(Asset::parse_short("ip:,"), Err(AssetError::EmptyValue));

        let decoded: Asset = serde_json::from_str(r#"{"kind":"network","networks":[]}"#).unwrap();
        assert!(decoded.messages().is_empty());
        assert_eq!(decoded.validate(), Err(AssetError::EmptyValue));
    }

    #[test]
    fn test_same_asset_yields_same_id() {
        let a = Asset::parse_short("link:https://example.com").unwrap();
        let b = Asset::parse_short("link:https://example.com").unwrap();
        assert_eq!(a.messages()[0].1.asset_id, b.messages()[0].1.asset_id);
        assert_eq!(a.messages()[0].0, well_known::ASSET_LINK);
    }
}
