//! XML import and export of topologies
//!
//! The document mirrors the tree: one `<object>` element per object with
//! its cpuset as a mask attribute, `<info>` children for attributes and
//! nested `<object>` elements for children.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::cpuset::{CpuSet, CpuSetError};
use crate::object::{ObjectId, ObjectKind, TopologyObject, UnknownKind};
use crate::topology::{Topology, TopologyError};

pub const XML_FORMAT_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("Failed to parse topology XML: {0}")]
    ParseError(String),
    #[error("Failed to serialize topology XML: {0}")]
    SerializeError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid cpuset in topology XML: {0}")]
    CpuSet(#[from] CpuSetError),
    #[error(transparent)]
    Kind(#[from] UnknownKind),
    #[error("Invalid topology XML structure: {0}")]
    Topology(#[from] TopologyError),
}

/// Root XML document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "topology")]
pub struct XmlTopology {
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "@complete_cpuset", default, skip_serializing_if = "Option::is_none")]
    pub complete_cpuset: Option<String>,
    pub object: XmlObject,
}

/// Object element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlObject {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@os_index", default, skip_serializing_if = "Option::is_none")]
    pub os_index: Option<u32>,
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "@cpuset")]
    pub cpuset: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<XmlInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object: Vec<XmlObject>,
}

/// Info attribute element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlInfo {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@value")]
    pub value: String,
}

/// Serialize a topology to an XML string
pub fn to_xml(topology: &Topology) -> Result<String, XmlError> {
    let document = XmlTopology {
        version: XML_FORMAT_VERSION.to_string(),
        complete_cpuset: (!topology.is_complete()).then(|| topology.complete_cpuset().to_string()),
        object: export_object(topology, topology.root()),
    };
    let xml = to_string(&document).map_err(|e| XmlError::SerializeError(e.to_string()))?;
    Ok(format!("<?xml version='1.0'?>\n{}\n", xml))
}

fn export_object(topology: &Topology, id: ObjectId) -> XmlObject {
    let object = &topology[id];
    XmlObject {
        kind: object.kind.as_str().to_string(),
        os_index: object.os_index,
        name: object.name.clone(),
        cpuset: object.cpuset.to_string(),
        info: object
            .infos
            .iter()
            .map(|(name, value)| XmlInfo {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        object: topology
            .children(id)
            .iter()
            .map(|&child| export_object(topology, child))
            .collect(),
    }
}

fn import_object(element: &XmlObject) -> Result<TopologyObject, XmlError> {
    let kind: ObjectKind = element.kind.parse()?;
    let cpuset: CpuSet = element.cpuset.parse()?;
    let mut object = TopologyObject::new(kind, cpuset);
    object.os_index = element.os_index;
    object.name = element.name.clone();
    for info in &element.info {
        object.set_info(info.name.clone(), info.value.clone());
    }
    Ok(object)
}

/// Parse a topology from an XML string
pub fn from_xml(xml: &str) -> Result<Topology, XmlError> {
    let document: XmlTopology = from_str(xml).map_err(|e| XmlError::ParseError(e.to_string()))?;

    let root = import_object(&document.object)?;
    let mut topology = Topology::new(root);

    let mut stack: Vec<(&XmlObject, ObjectId)> = document
        .object
        .object
        .iter()
        .rev()
        .map(|child| (child, topology.root()))
        .collect();
    while let Some((element, parent)) = stack.pop() {
        let id = topology.insert_child(parent, import_object(element)?)?;
        stack.extend(element.object.iter().rev().map(|child| (child, id)));
    }

    if let Some(complete) = &document.complete_cpuset {
        topology.set_complete_cpuset(complete.parse()?);
    }

    topology.validate()?;
    Ok(topology)
}

/// Parse a topology from an XML file
pub fn from_file(path: &Path) -> Result<Topology, XmlError> {
    let content = std::fs::read_to_string(path)?;
    from_xml(&content)
}
