//! On-disk fixture builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::Dtype;

/// Name, shape and row-major f32 values of one fixture tensor.
pub type FixtureTensor = (String, Vec<usize>, Vec<f32>);

pub fn filled(name: &str, shape: &[usize], value: f32) -> FixtureTensor {
    let len = shape.iter().product();
    (name.to_string(), shape.to_vec(), vec![value; len])
}

/// Write a safetensors file with optional `__metadata__`.
pub fn write_safetensors(
    path: &Path,
    tensors: &[FixtureTensor],
    metadata: Option<HashMap<String, String>>,
) {
    let bytes: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, _, data)| data.iter().flat_map(|f| f.to_le_bytes()).collect())
        .collect();

    let views: HashMap<String, TensorView<'_>> = tensors
        .iter()
        .zip(&bytes)
        .map(|((name, shape, _), raw)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), raw)
                .expect("Failed to create tensor view");
            (name.clone(), view)
        })
        .collect();

    let serialized = safetensors::serialize(&views, &metadata).expect("Failed to serialize");
    std::fs::write(path, serialized).expect("Failed to write fixture");
}

/// Write a `torch.save`-style zip archive whose `data.pkl` is `pickle`.
pub fn write_torch_archive(path: &Path, pickle: &[u8]) {
    write_torch_archive_with_storages(path, pickle, &[]);
}

/// Write a `torch.save` zip archive with raw storages under `archive/data/<i>`.
pub fn write_torch_archive_with_storages(path: &Path, pickle: &[u8], storages: &[Vec<u8>]) {
    let file = std::fs::File::create(path).expect("Failed to create archive");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    zip.start_file("archive/data.pkl", options)
        .expect("Failed to start data.pkl");
    zip.write_all(pickle).expect("Failed to write data.pkl");
    for (i, storage) in storages.iter().enumerate() {
        zip.start_file(format!("archive/data/{i}"), options)
            .expect("Failed to start storage");
        zip.write_all(storage).expect("Failed to write storage");
    }
    zip.finish().expect("Failed to finish archive");
}

/// Write what `torch.save` produces for a dict of float tensors.
///
/// With `container` set the tensors sit under that key next to `extra`
/// entries; otherwise the file is a bare state dict and `extra` is ignored.
pub fn write_torch_state_dict(
    path: &Path,
    container: Option<&str>,
    tensors: &[FixtureTensor],
    extra: &[(&str, Vec<u8>)],
) {
    use pickle::*;
    let mut out = PROTO_2.to_vec();

    if let Some(key) = container {
        out.push(EMPTY_DICT);
        out.push(MARK);
        out.extend(unicode(key));
    }

    out.extend(ordered_dict());
    out.push(MARK);
    for (i, (name, shape, data)) in tensors.iter().enumerate() {
        out.extend(unicode(name));
        out.extend(float_tensor(i, shape, data.len()));
    }
    out.push(SETITEMS);

    if container.is_some() {
        for (key, value) in extra {
            out.extend(unicode(key));
            out.extend_from_slice(value);
        }
        out.push(SETITEMS);
    }
    out.push(STOP);

    let storages: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, _, data)| data.iter().flat_map(|f| f.to_le_bytes()).collect())
        .collect();
    write_torch_archive_with_storages(path, &out, &storages);
}

/// Protocol-2 pickle opcodes used to hand-assemble fixtures.
pub mod pickle {
    pub const PROTO_2: &[u8] = b"\x80\x02";
    pub const EMPTY_DICT: u8 = b'}';
    pub const EMPTY_LIST: u8 = b']';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const MARK: u8 = b'(';
    pub const SETITEMS: u8 = b'u';
    pub const APPENDS: u8 = b'e';
    pub const REDUCE: u8 = b'R';
    pub const BUILD: u8 = b'b';
    pub const STOP: u8 = b'.';
    pub const TUPLE: u8 = b't';
    pub const BINPERSID: u8 = b'Q';
    pub const NEWFALSE: u8 = 0x89;

    pub fn unicode(s: &str) -> Vec<u8> {
        let mut out = vec![b'X'];
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub fn small_int(n: u8) -> Vec<u8> {
        vec![b'K', n]
    }

    pub fn binint(n: u32) -> Vec<u8> {
        let mut out = vec![b'J'];
        out.extend_from_slice(&n.to_le_bytes());
        out
    }

    pub fn global(module: &str, name: &str) -> Vec<u8> {
        format!("c{}\n{}\n", module, name).into_bytes()
    }

    pub fn int_tuple(values: &[usize]) -> Vec<u8> {
        let mut out = vec![MARK];
        for v in values {
            out.extend(binint(*v as u32));
        }
        out.push(TUPLE);
        out
    }

    /// `collections.OrderedDict()`
    pub fn ordered_dict() -> Vec<u8> {
        let mut out = global("collections", "OrderedDict");
        out.push(EMPTY_TUPLE);
        out.push(REDUCE);
        out
    }

    /// `torch._utils._rebuild_tensor_v2` over FloatStorage key `storage`.
    pub fn float_tensor(storage: usize, shape: &[usize], numel: usize) -> Vec<u8> {
        let mut stride = vec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * shape[i + 1];
        }

        let mut out = global("torch._utils", "_rebuild_tensor_v2");
        out.push(MARK);

        out.push(MARK);
        out.extend(unicode("storage"));
        out.extend(global("torch", "FloatStorage"));
        out.extend(unicode(&storage.to_string()));
        out.extend(unicode("cpu"));
        out.extend(binint(numel as u32));
        out.push(TUPLE);
        out.push(BINPERSID);

        out.extend(binint(0));
        out.extend(int_tuple(shape));
        out.extend(int_tuple(&stride));
        out.push(NEWFALSE);
        out.extend(ordered_dict());
        out.push(TUPLE);
        out.push(REDUCE);
        out
    }
}

/// `{"class_names": [..], "num_classes": n, "architecture": tag}` with no tensors.
pub fn metadata_only_pickle(class_names: &[&str], architecture: &str) -> Vec<u8> {
    use pickle::*;
    let mut out = PROTO_2.to_vec();
    out.push(EMPTY_DICT);
    out.push(MARK);

    out.extend(unicode("class_names"));
    out.push(EMPTY_LIST);
    out.push(MARK);
    for name in class_names {
        out.extend(unicode(name));
    }
    out.push(APPENDS);

    out.extend(unicode("num_classes"));
    out.extend(small_int(class_names.len() as u8));

    out.extend(unicode("architecture"));
    out.extend(unicode(architecture));

    out.push(SETITEMS);
    out.push(STOP);
    out
}
