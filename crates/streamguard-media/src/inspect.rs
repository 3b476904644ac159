//! Human-oriented dumps of container layout.

use serde::Serialize;

use crate::ebml::{self, ids};
use crate::fragment::ContainerFamily;
use crate::mp4::{self, AtomType};

/// One box or element in a layout dump.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutNode {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub depth: usize,
    /// The whole node lies inside the buffer.
    pub complete: bool,
}

const MP4_CONTAINERS: [AtomType; 2] = [AtomType::MOOV, AtomType::TRAK];

/// List the boxes or elements of `buf`, descending into the ones that
/// carry index information.
pub fn layout(family: ContainerFamily, buf: &[u8]) -> Vec<LayoutNode> {
    match family {
        ContainerFamily::Mp4 => {
            let mut nodes = Vec::new();
            mp4_layout(buf, 0, 0, &mut nodes);
            nodes
        }
        ContainerFamily::Webm => {
            let recurse = |id: u32| {
                matches!(
                    id,
                    ids::SEGMENT | ids::CUES | ids::CUE_POINT | ids::CUE_TRACK_POSITIONS
                )
            };
            let mut nodes = Vec::new();
            for element in ebml::parse_elements(buf, 0, buf.len(), &recurse) {
                ebml_layout(&element, 0, buf.len(), &mut nodes);
            }
            nodes
        }
    }
}

fn mp4_layout(buf: &[u8], base: u64, depth: usize, nodes: &mut Vec<LayoutNode>) {
    for atom in mp4::walk_atoms(buf) {
        let complete = atom.is_complete_in(buf.len());
        nodes.push(LayoutNode {
            name: atom.atom_type.to_string(),
            offset: base + atom.offset as u64,
            size: atom.size,
            depth,
            complete,
        });
        if complete && MP4_CONTAINERS.contains(&atom.atom_type) {
            let body_start = atom.offset + atom.header_size as usize;
            let body_end = atom.end() as usize;
            mp4_layout(&buf[body_start..body_end], base + body_start as u64, depth + 1, nodes);
        }
    }
}

fn ebml_layout(element: &ebml::Element, depth: usize, len: usize, nodes: &mut Vec<LayoutNode>) {
    let name = ebml::element_name(element.id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:#x}", element.id));
    nodes.push(LayoutNode {
        name,
        offset: element.start as u64,
        size: element.end() - element.start as u64,
        depth,
        complete: element.end() <= len as u64,
    });
    for child in &element.children {
        ebml_layout(child, depth + 1, len, nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::test_boxes::*;

    #[test]
    fn test_mp4_layout_descends_into_moov() {
        let file = [
            boxed(b"ftyp", b"isom\0\0\0\0"),
            moov_with_tracks(&[(1, 1)]),
            fragment(40),
        ]
        .concat();
        let nodes = layout(ContainerFamily::Mp4, &file);
        let names: Vec<(&str, usize)> = nodes.iter().map(|n| (n.name.as_str(), n.depth)).collect();
        assert_eq!(
            names,
            vec![
                ("ftyp", 0),
                ("moov", 0),
                ("trak", 1),
                ("tkhd", 2),
                ("moof", 0),
                ("mdat", 0)
            ]
        );
        assert!(nodes.iter().all(|n| n.complete));
    }

    #[test]
    fn test_ebml_layout_names_unknown_ids() {
        let buf = ebml::encode_element(0x4286, &[0x81]);
        let nodes = layout(ContainerFamily::Webm, &buf);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "0x4286");
        assert_eq!(nodes[0].size, 4);
    }
}
