//! XML export, reloadable with `--input`

use arbor_core::{xml, Topology};
use std::io::Write;

use super::{RenderError, RenderOptions, Renderer};

pub struct XmlRenderer;

impl Renderer for XmlRenderer {
    fn render(&self, topology: &Topology, _options: &RenderOptions, out: &mut dyn Write) -> Result<(), RenderError> {
        let document = xml::to_xml(topology)?;
        out.write_all(document.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{synthetic, ObjectKind};

    #[test]
    fn test_xml_output_reloads() {
        let topology = synthetic::build("package:2 core:2 pu:1").unwrap();
        let mut out = Vec::new();
        XmlRenderer
            .render(&topology, &RenderOptions::default(), &mut out)
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<?xml version='1.0'?>"));
        let reloaded = xml::from_xml(&text).unwrap();
        assert_eq!(reloaded.objects_of_kind(ObjectKind::Core).len(), 4);
    }
}
