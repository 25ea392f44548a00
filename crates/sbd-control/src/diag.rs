//! Diagnostics: read backing-store and node headers straight off the disk.
//!
//! Dumps open the store read-only with the geometry recorded in the catalog
//! entry and release it on every exit path. Output keys carry numeric
//! prefixes so pretty-printed JSON keeps the on-disk field order.

use sbd_error::Result;
use sbd_store::header::HEADER_SIZE;
use sbd_store::store::OpenMode;
use sbd_store::stree::{KEY_LENGTH, NodeRecord};
use sbd_store::{AlignedStore, IoPath, StoreHeader};
use sbd_types::{DeviceSpec, hex_dump};
use serde::Serialize;
use std::collections::BTreeMap;

/// A raw hex dump plus pretty-printed fields.
#[derive(Debug, Serialize)]
pub struct Dump {
    pub raw: String,
    pub fields: BTreeMap<String, String>,
}

fn open_readonly(spec: &DeviceSpec) -> Result<AlignedStore> {
    AlignedStore::open_file(
        &spec.storage_file,
        IoPath {
            directio: spec.directio,
            sync: false,
        },
        spec.node_calculated_size,
        spec.alignment,
        OpenMode::ReadOnly,
    )
}

fn field(value: u64) -> String {
    format!("{value} 0x{value:08x}")
}

/// Pretty-print the backing-store header of a cataloged device.
pub fn dump_header(spec: &DeviceSpec) -> Result<Dump> {
    let store = open_readonly(spec)?;
    let data = store.read_slot(0)?;
    let header_bytes = &data[..HEADER_SIZE];
    let header = StoreHeader::deserialize(header_bytes)?;

    let mut fields = BTreeMap::new();
    fields.insert("0001_magic".to_owned(), format!("0x{:016x}", header.magic));
    fields.insert(
        "0002_store_size_in_bytes".to_owned(),
        field(header.store_size_in_bytes),
    );
    fields.insert(
        "0003_nodes_per_block".to_owned(),
        field(u64::from(header.nodes_per_block)),
    );
    fields.insert(
        "0004_block_size".to_owned(),
        field(u64::from(header.block_size)),
    );
    fields.insert(
        "0005_block_count".to_owned(),
        field(u64::from(header.block_count)),
    );
    fields.insert(
        "0006_root_node".to_owned(),
        field(u64::from(header.root_node)),
    );
    fields.insert(
        "0007_free_position".to_owned(),
        field(u64::from(header.free_position)),
    );
    fields.insert(
        "0008_alignment".to_owned(),
        field(u64::from(header.alignment)),
    );
    fields.insert("0009_dirty".to_owned(), field(u64::from(header.dirty)));

    Ok(Dump {
        raw: hex_dump(header_bytes),
        fields,
    })
}

/// Pretty-print the node header stored at `block_index`.
pub fn dump_node_header(spec: &DeviceSpec, block_index: u32) -> Result<Dump> {
    let store = open_readonly(spec)?;
    let data = store.read_slot(block_index)?;
    let node = NodeRecord::parse(
        &data,
        KEY_LENGTH,
        spec.node_value_size,
        spec.additional_nodes_per_block,
    )?;

    let header_len = NodeRecord::header_len(KEY_LENGTH, spec.additional_nodes_per_block);
    let mut fields = BTreeMap::new();
    fields.insert(
        "0001_parent_block_num".to_owned(),
        field(u64::from(node.parent)),
    );
    fields.insert(
        "0002_left_child_block_num".to_owned(),
        field(u64::from(node.left)),
    );
    fields.insert(
        "0003_right_child_block_num".to_owned(),
        field(u64::from(node.right)),
    );
    fields.insert(
        "0004_key_length".to_owned(),
        field(node.key.len() as u64),
    );
    fields.insert(
        "0005_value_length".to_owned(),
        field(u64::from(node.value_len)),
    );
    fields.insert(
        "0006_offspring_per_node".to_owned(),
        field(u64::from(spec.additional_nodes_per_block)),
    );
    fields.insert(
        "0007_offspring".to_owned(),
        node.offspring
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    );
    fields.insert("0008_key".to_owned(), hex_dump(&node.key));

    Ok(Dump {
        raw: hex_dump(&data[..header_len]),
        fields,
    })
}

/// Reserved command surface; the block-content dump prints nothing yet.
pub fn dump_block(_spec: &DeviceSpec, _block_index: u32) -> Result<()> {
    Ok(())
}
