//! Build provenance ("material info")
//!
//! The provenance blob is stored opaquely as compact JSON. It is a list of
//! materials, each naming a repository and the modifications (commits) the
//! build consumed.

use crate::{DataSource, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfiguration {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    #[serde(rename = "plugin-id", default)]
    pub plugin_id: String,
    #[serde(rename = "git-configuration", default)]
    pub git_configuration: RepoConfiguration,
    #[serde(rename = "scm-configuration", default)]
    pub scm_configuration: RepoConfiguration,
    #[serde(rename = "type", default)]
    pub material_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    #[serde(default)]
    pub revision: String,
    #[serde(rename = "modified-time", default)]
    pub modified_time: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialInfo {
    #[serde(default)]
    pub material: Material,
    #[serde(default)]
    pub changed: bool,
    #[serde(default)]
    pub modifications: Vec<Modification>,
}

/// Parse and re-serialise compactly. `None` or blank input becomes `[]`.
pub fn compact(raw: Option<&str>) -> Result<String, ValidationError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok("[]".to_string()),
        Some(r) => r,
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ValidationError::InvalidMaterialInfo {
            reason: e.to_string(),
        })?;
    serde_json::to_string(&value).map_err(|e| ValidationError::InvalidMaterialInfo {
        reason: e.to_string(),
    })
}

fn decode(material_info: &str) -> Result<Vec<MaterialInfo>, ValidationError> {
    serde_json::from_str(material_info).map_err(|e| ValidationError::InvalidMaterialInfo {
        reason: e.to_string(),
    })
}

/// Map repository url to the revision the build consumed.
///
/// `data_source` is the raw data-source name recorded with the artifact.
pub fn parse_material_info(
    material_info: &str,
    data_source: &str,
) -> Result<BTreeMap<String, String>, ValidationError> {
    data_source
        .parse::<DataSource>()
        .map_err(|_| ValidationError::UnsupportedDataSource {
            data_source: data_source.to_string(),
        })?;
    let mut scm = BTreeMap::new();
    for info in decode(material_info)? {
        let url = match info.material.material_type.as_str() {
            "git" => &info.material.git_configuration.url,
            "scm" => &info.material.scm_configuration.url,
            other => {
                return Err(ValidationError::InvalidMaterialInfo {
                    reason: format!("unknown material type: {}", other),
                })
            }
        };
        let revision = info
            .modifications
            .first()
            .map(|m| m.revision.clone())
            .ok_or_else(|| ValidationError::InvalidMaterialInfo {
                reason: format!("material {} has no modifications", url.trim()),
            })?;
        scm.insert(url.trim().to_string(), revision);
    }
    Ok(scm)
}

/// First revision of every material, comma joined. Used as the human
/// readable `source` of build notifications. Undecodable blobs yield "".
pub fn source_revisions(material_info: &str) -> String {
    decode(material_info)
        .unwrap_or_default()
        .iter()
        .filter_map(|m| m.modifications.first().map(|md| md.revision.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}
