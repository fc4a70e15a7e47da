//! Binary glTF 2.0 (GLB) writer and a reader for the subset it emits.
//!
//! Output is deterministic: the JSON chunk is serialized from sorted maps and
//! nothing time-dependent goes into it, so identical meshes and options give
//! identical bytes.

use std::fs;
use std::io;
use std::path::Path;

use meshgen_types::Mesh;
use serde_json::{json, Map, Value};

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;
const HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

const COMPONENT_U8: u64 = 5121;
const COMPONENT_U16: u64 = 5123;
const COMPONENT_U32: u64 = 5125;
const COMPONENT_F32: u64 = 5126;
const TARGET_ARRAY_BUFFER: u64 = 34962;
const TARGET_ELEMENT_ARRAY_BUFFER: u64 = 34963;
const MODE_TRIANGLES: u64 = 4;
const FILTER_LINEAR: u64 = 9729;
const FILTER_LINEAR_MIPMAP_LINEAR: u64 = 9987;
const WRAP_REPEAT: u64 = 10497;

pub const GENERATOR: &str = "meshgen";

pub struct EmbeddedImage<'a> {
    pub mime_type: &'static str,
    pub bytes: &'a [u8],
}

/// Metallic-roughness material with embedded textures.
pub struct PbrMaterial<'a> {
    pub base_color: EmbeddedImage<'a>,
    /// Blue channel metallic, green channel roughness.
    pub metallic_roughness: Option<EmbeddedImage<'a>>,
    pub metallic_factor: f32,
    pub roughness_factor: f32,
}

#[derive(Default)]
pub struct GlbOptions<'a> {
    pub include_normals: bool,
    pub extras: Option<&'a Value>,
    pub material: Option<PbrMaterial<'a>>,
}

#[derive(Default)]
struct BinBuilder {
    data: Vec<u8>,
    views: Vec<Value>,
}

impl BinBuilder {
    fn push_view(&mut self, bytes: &[u8], target: Option<u64>) -> usize {
        pad_to_four(&mut self.data, 0);
        let mut view = json!({
            "buffer": 0,
            "byteOffset": self.data.len(),
            "byteLength": bytes.len(),
        });
        if let Some(target) = target {
            view["target"] = json!(target);
        }
        self.data.extend_from_slice(bytes);
        self.views.push(view);
        self.views.len() - 1
    }
}

pub fn encode(mesh: &Mesh, options: &GlbOptions<'_>) -> io::Result<Vec<u8>> {
    let (min, max) = mesh
        .bounds()
        .ok_or_else(|| invalid_input("cannot export an empty mesh"))?;
    let vertex_count = mesh.vertex_count();

    let mut bin = BinBuilder::default();
    let mut accessors = Vec::new();
    let mut attributes = Map::new();

    let positions = bin.push_view(&f32_bytes(mesh.vertices.iter().flatten()), Some(TARGET_ARRAY_BUFFER));
    accessors.push(json!({
        "bufferView": positions,
        "componentType": COMPONENT_F32,
        "count": vertex_count,
        "type": "VEC3",
        "min": min,
        "max": max,
    }));
    attributes.insert("POSITION".into(), json!(accessors.len() - 1));

    if options.include_normals {
        let normals = mesh.vertex_normals();
        let view = bin.push_view(&f32_bytes(normals.iter().flatten()), Some(TARGET_ARRAY_BUFFER));
        accessors.push(json!({
            "bufferView": view,
            "componentType": COMPONENT_F32,
            "count": vertex_count,
            "type": "VEC3",
        }));
        attributes.insert("NORMAL".into(), json!(accessors.len() - 1));
    }

    if let Some(uvs) = &mesh.uvs {
        let view = bin.push_view(&f32_bytes(uvs.iter().flatten()), Some(TARGET_ARRAY_BUFFER));
        accessors.push(json!({
            "bufferView": view,
            "componentType": COMPONENT_F32,
            "count": uvs.len(),
            "type": "VEC2",
        }));
        attributes.insert("TEXCOORD_0".into(), json!(accessors.len() - 1));
    }

    let index_bytes: Vec<u8> = mesh
        .faces
        .iter()
        .flatten()
        .flat_map(|i| i.to_le_bytes())
        .collect();
    let indices_view = bin.push_view(&index_bytes, Some(TARGET_ELEMENT_ARRAY_BUFFER));
    accessors.push(json!({
        "bufferView": indices_view,
        "componentType": COMPONENT_U32,
        "count": mesh.face_count() * 3,
        "type": "SCALAR",
    }));
    let indices_accessor = accessors.len() - 1;

    let mut primitive = json!({
        "attributes": attributes,
        "indices": indices_accessor,
        "mode": MODE_TRIANGLES,
    });

    let mut root = json!({
        "asset": { "version": "2.0", "generator": GENERATOR },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
    });

    if let Some(material) = &options.material {
        let mut images = Vec::new();
        let mut textures = Vec::new();
        let mut pbr = json!({
            "metallicFactor": material.metallic_factor,
            "roughnessFactor": material.roughness_factor,
        });

        let base = bin.push_view(material.base_color.bytes, None);
        images.push(json!({ "bufferView": base, "mimeType": material.base_color.mime_type }));
        textures.push(json!({ "source": images.len() - 1, "sampler": 0 }));
        pbr["baseColorTexture"] = json!({ "index": textures.len() - 1 });

        if let Some(mr) = &material.metallic_roughness {
            let view = bin.push_view(mr.bytes, None);
            images.push(json!({ "bufferView": view, "mimeType": mr.mime_type }));
            textures.push(json!({ "source": images.len() - 1, "sampler": 0 }));
            pbr["metallicRoughnessTexture"] = json!({ "index": textures.len() - 1 });
        }

        root["images"] = json!(images);
        root["textures"] = json!(textures);
        root["samplers"] = json!([{
            "magFilter": FILTER_LINEAR,
            "minFilter": FILTER_LINEAR_MIPMAP_LINEAR,
            "wrapS": WRAP_REPEAT,
            "wrapT": WRAP_REPEAT,
        }]);
        root["materials"] = json!([{
            "name": "material_0",
            "pbrMetallicRoughness": pbr,
            "doubleSided": true,
        }]);
        primitive["material"] = json!(0);
    }

    if let Some(extras) = options.extras {
        root["asset"]["extras"] = extras.clone();
    }

    pad_to_four(&mut bin.data, 0);
    root["meshes"] = json!([{ "primitives": [primitive] }]);
    root["accessors"] = json!(accessors);
    root["bufferViews"] = json!(bin.views);
    root["buffers"] = json!([{ "byteLength": bin.data.len() }]);

    let mut json_chunk = serde_json::to_vec(&root).map_err(io::Error::other)?;
    pad_to_four(&mut json_chunk, b' ');

    let total = HEADER_LEN + CHUNK_HEADER_LEN + json_chunk.len() + CHUNK_HEADER_LEN + bin.data.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_chunk);
    out.extend_from_slice(&(bin.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin.data);
    Ok(out)
}

pub fn write(mesh: &Mesh, path: &Path, options: &GlbOptions<'_>) -> io::Result<()> {
    fs::write(path, encode(mesh, options)?)
}

pub fn read_mesh(path: &Path) -> io::Result<Mesh> {
    decode(&fs::read(path)?)
}

/// Parse the first primitive of the first mesh.
pub fn decode(bytes: &[u8]) -> io::Result<Mesh> {
    if bytes.len() < HEADER_LEN + CHUNK_HEADER_LEN {
        return Err(invalid_data("file too short for a GLB header"));
    }
    if read_u32(bytes, 0) != GLB_MAGIC {
        return Err(invalid_data("not a GLB file"));
    }
    if read_u32(bytes, 4) != GLB_VERSION {
        return Err(invalid_data("unsupported glTF container version"));
    }

    let json_len = read_u32(bytes, 12) as usize;
    if read_u32(bytes, 16) != CHUNK_JSON {
        return Err(invalid_data("first chunk is not JSON"));
    }
    let json_start = HEADER_LEN + CHUNK_HEADER_LEN;
    let json_end = json_start + json_len;
    let json_bytes = bytes
        .get(json_start..json_end)
        .ok_or_else(|| invalid_data("truncated JSON chunk"))?;
    let root: Value = serde_json::from_slice(json_bytes).map_err(|e| invalid_data(&e.to_string()))?;

    let bin: &[u8] = if bytes.len() >= json_end + CHUNK_HEADER_LEN && read_u32(bytes, json_end + 4) == CHUNK_BIN {
        let bin_len = read_u32(bytes, json_end) as usize;
        let start = json_end + CHUNK_HEADER_LEN;
        bytes
            .get(start..start + bin_len)
            .ok_or_else(|| invalid_data("truncated BIN chunk"))?
    } else {
        &[]
    };

    let primitive = &root["meshes"][0]["primitives"][0];
    if primitive.is_null() {
        return Err(invalid_data("GLB contains no mesh primitive"));
    }

    let position_index = accessor_index(&primitive["attributes"]["POSITION"])
        .ok_or_else(|| invalid_data("primitive has no POSITION attribute"))?;
    let vertices: Vec<[f32; 3]> = read_floats(&root, bin, position_index, 3)?
        .chunks_exact(3)
        .map(|c| [c[0], c[1], c[2]])
        .collect();

    let faces: Vec<[u32; 3]> = match accessor_index(&primitive["indices"]) {
        Some(index) => read_indices(&root, bin, index)?,
        None => (0..vertices.len() as u32).collect(),
    }
    .chunks_exact(3)
    .map(|c| [c[0], c[1], c[2]])
    .collect();

    let uvs = match accessor_index(&primitive["attributes"]["TEXCOORD_0"]) {
        Some(index) => Some(
            read_floats(&root, bin, index, 2)?
                .chunks_exact(2)
                .map(|c| [c[0], c[1]])
                .collect(),
        ),
        None => None,
    };

    let mesh = Mesh { vertices, faces, uvs };
    if !mesh.is_consistent() {
        return Err(invalid_data("face indices out of range"));
    }
    Ok(mesh)
}

struct AccessorData<'a> {
    data: &'a [u8],
    count: usize,
    stride: usize,
    component_type: u64,
}

fn accessor_data<'a>(root: &Value, bin: &'a [u8], index: usize, components: usize) -> io::Result<AccessorData<'a>> {
    let accessor = root["accessors"]
        .get(index)
        .ok_or_else(|| invalid_data("accessor index out of range"))?;
    let view_index = accessor_index(&accessor["bufferView"]).ok_or_else(|| invalid_data("accessor without bufferView"))?;
    let view = root["bufferViews"]
        .get(view_index)
        .ok_or_else(|| invalid_data("bufferView index out of range"))?;

    let count = accessor["count"].as_u64().unwrap_or(0) as usize;
    let component_type = accessor["componentType"].as_u64().unwrap_or(0);
    let component_size = match component_type {
        COMPONENT_F32 | COMPONENT_U32 => 4,
        COMPONENT_U16 => 2,
        COMPONENT_U8 => 1,
        _ => return Err(invalid_data("unsupported accessor component type")),
    };
    let element_size = component_size * components;
    let stride = view["byteStride"].as_u64().map_or(element_size, |s| s as usize);

    let view_offset = view["byteOffset"].as_u64().unwrap_or(0) as usize;
    let view_len = view["byteLength"].as_u64().unwrap_or(0) as usize;
    let start = view_offset + accessor["byteOffset"].as_u64().unwrap_or(0) as usize;
    let needed = if count == 0 { 0 } else { stride * (count - 1) + element_size };
    if start + needed > view_offset + view_len {
        return Err(invalid_data("accessor overruns its bufferView"));
    }
    let data = bin
        .get(start..start + needed)
        .ok_or_else(|| invalid_data("accessor overruns the BIN chunk"))?;

    Ok(AccessorData {
        data,
        count,
        stride,
        component_type,
    })
}

fn read_floats(root: &Value, bin: &[u8], index: usize, components: usize) -> io::Result<Vec<f32>> {
    let accessor = accessor_data(root, bin, index, components)?;
    if accessor.component_type != COMPONENT_F32 {
        return Err(invalid_data("expected float accessor"));
    }
    let mut values = Vec::with_capacity(accessor.count * components);
    for element in 0..accessor.count {
        let base = element * accessor.stride;
        for c in 0..components {
            values.push(f32::from_bits(read_u32(accessor.data, base + c * 4)));
        }
    }
    Ok(values)
}

fn read_indices(root: &Value, bin: &[u8], index: usize) -> io::Result<Vec<u32>> {
    let accessor = accessor_data(root, bin, index, 1)?;
    let mut indices = Vec::with_capacity(accessor.count);
    for element in 0..accessor.count {
        let offset = element * accessor.stride;
        let value = match accessor.component_type {
            COMPONENT_U32 => read_u32(accessor.data, offset),
            COMPONENT_U16 => u16::from_le_bytes([accessor.data[offset], accessor.data[offset + 1]]) as u32,
            COMPONENT_U8 => accessor.data[offset] as u32,
            _ => return Err(invalid_data("unsupported index component type")),
        };
        indices.push(value);
    }
    Ok(indices)
}

fn accessor_index(value: &Value) -> Option<usize> {
    value.as_u64().map(|v| v as usize)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn f32_bytes<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

fn pad_to_four(buf: &mut Vec<u8>, fill: u8) {
    while buf.len() % 4 != 0 {
        buf.push(fill);
    }
}

fn invalid_input(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
