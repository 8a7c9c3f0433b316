//! Canonical GVariant serialization for the object wire formats.
//!
//! The store reads serialized objects by casting them with [`gvariant`]
//! markers; this module is the write side, producing normal-form bytes for
//! the handful of shapes the repository uses (tuples, arrays, `a{sv}`
//! dictionaries, strings, byte arrays and fixed integers), plus an owned
//! value model for metadata dictionaries.
//!
//! Multi-byte integers in the object formats are stored big-endian at the
//! value level; container framing follows the canonical little-endian
//! GVariant rules.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

/// A metadata dictionary (`a{sv}`), as found in commits, detached commit
/// metadata, and the summary.  Keys serialize in sorted order.
pub type VariantDict = BTreeMap<String, Variant>;

/// An owned value held in a [`VariantDict`].
///
/// The store only ever interprets a closed set of value types; anything else
/// round-trips untouched through [`Variant::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// `s`
    String(String),
    /// `t`, stored big-endian (timestamps, sizes).
    Uint64(u64),
    /// `ay`
    Bytes(Vec<u8>),
    /// `aay` (detached signature packet lists).
    ByteArrays(Vec<Vec<u8>>),
    /// `a{sv}`
    Dict(VariantDict),
    /// Any other type, kept as its serialized bytes.
    Other(String, Vec<u8>),
}

impl Variant {
    /// The GVariant type string of this value.
    pub fn type_string(&self) -> &str {
        match self {
            Variant::String(_) => "s",
            Variant::Uint64(_) => "t",
            Variant::Bytes(_) => "ay",
            Variant::ByteArrays(_) => "aay",
            Variant::Dict(_) => "a{sv}",
            Variant::Other(ts, _) => ts,
        }
    }

    /// Serialize just the value (not the enclosing variant framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Variant::String(s) => serialize_string(s),
            Variant::Uint64(v) => v.to_be_bytes().to_vec(),
            Variant::Bytes(b) => b.clone(),
            Variant::ByteArrays(arrays) => {
                serialize_var_array(arrays.iter().map(|a| a.to_vec()).collect(), 1)
            }
            Variant::Dict(d) => serialize_dict(d),
            Variant::Other(_, b) => b.clone(),
        }
    }

    /// Parse a value of the given type.  Unknown types are preserved opaquely.
    pub fn from_bytes(typestr: &str, data: &[u8]) -> Result<Self> {
        Ok(match typestr {
            "s" => Variant::String(parse_string(data)?),
            "t" => {
                let b: [u8; 8] = data
                    .try_into()
                    .map_err(|_| anyhow!("Invalid uint64 of {} bytes", data.len()))?;
                Variant::Uint64(u64::from_be_bytes(b))
            }
            "ay" => Variant::Bytes(data.to_vec()),
            "aay" => Variant::ByteArrays(
                split_var_array(data, 1)?
                    .into_iter()
                    .map(|e| e.to_vec())
                    .collect(),
            ),
            "a{sv}" => Variant::Dict(parse_dict(data)?),
            other => Variant::Other(other.to_string(), data.to_vec()),
        })
    }

    /// Serialize with variant (`v`) framing: value, NUL, type string.
    pub(crate) fn to_variant_bytes(&self) -> Vec<u8> {
        let mut out = self.to_bytes();
        out.push(0);
        out.extend_from_slice(self.type_string().as_bytes());
        out
    }
}

/// Round a position up to an alignment boundary.
pub(crate) fn align_up(pos: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (pos + align - 1) & !(align - 1)
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    out.resize(align_up(out.len(), align), 0);
}

/// The framing offset size a reader derives from a container's length.
pub(crate) fn offset_size(len: usize) -> usize {
    if len <= 0xFF {
        1
    } else if len <= 0xFFFF {
        2
    } else if len <= 0xFFFF_FFFF {
        4
    } else {
        8
    }
}

/// The smallest offset size a writer can use such that the container,
/// including the offsets themselves, stays addressable.
fn pick_offset_size(body_len: usize, n_offsets: usize) -> usize {
    for osz in [1usize, 2, 4, 8] {
        let max = match osz {
            1 => 0xFF,
            2 => 0xFFFF,
            4 => 0xFFFF_FFFF,
            _ => usize::MAX,
        };
        if body_len + n_offsets * osz <= max {
            return osz;
        }
    }
    unreachable!()
}

fn write_offset(out: &mut Vec<u8>, value: usize, osz: usize) {
    let le = (value as u64).to_le_bytes();
    out.extend_from_slice(&le[..osz]);
}

fn read_offset(d: &[u8], pos: usize, osz: usize) -> Result<usize> {
    let end = pos
        .checked_add(osz)
        .filter(|&e| e <= d.len())
        .ok_or_else(|| anyhow!("Truncated framing offset"))?;
    let mut buf = [0u8; 8];
    buf[..osz].copy_from_slice(&d[pos..end]);
    Ok(u64::from_le_bytes(buf) as usize)
}

/// One member of a tuple being serialized.
pub(crate) struct Member {
    pub(crate) bytes: Vec<u8>,
    pub(crate) align: usize,
    pub(crate) fixed: bool,
}

impl Member {
    pub(crate) fn fixed(bytes: Vec<u8>, align: usize) -> Self {
        Member {
            bytes,
            align,
            fixed: true,
        }
    }

    pub(crate) fn variable(bytes: Vec<u8>, align: usize) -> Self {
        Member {
            bytes,
            align,
            fixed: false,
        }
    }
}

/// Serialize a tuple.  Variable-size members other than the last get end
/// offsets, appended in reverse member order.
pub(crate) fn serialize_tuple(members: Vec<Member>) -> Vec<u8> {
    let n = members.len();
    let all_fixed = members.iter().all(|m| m.fixed);
    let mut max_align = 1;
    let mut body = Vec::new();
    let mut ends = Vec::new();
    for (i, m) in members.into_iter().enumerate() {
        max_align = max_align.max(m.align);
        pad_to(&mut body, m.align);
        body.extend_from_slice(&m.bytes);
        if !m.fixed && i + 1 != n {
            ends.push(body.len());
        }
    }
    if all_fixed {
        pad_to(&mut body, max_align);
        return body;
    }
    let osz = pick_offset_size(body.len(), ends.len());
    for &end in ends.iter().rev() {
        write_offset(&mut body, end, osz);
    }
    body
}

/// Serialize an array of variable-size elements; end offsets are appended
/// in element order.
pub(crate) fn serialize_var_array(elems: Vec<Vec<u8>>, elem_align: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let mut ends = Vec::with_capacity(elems.len());
    for e in elems {
        pad_to(&mut body, elem_align);
        body.extend_from_slice(&e);
        ends.push(body.len());
    }
    let osz = pick_offset_size(body.len(), ends.len());
    for &end in &ends {
        write_offset(&mut body, end, osz);
    }
    body
}

/// Split a serialized array of variable-size elements.
pub(crate) fn split_var_array(d: &[u8], elem_align: usize) -> Result<Vec<&[u8]>> {
    if d.is_empty() {
        return Ok(Vec::new());
    }
    let osz = offset_size(d.len());
    let body_end = read_offset(d, d.len() - osz, osz)?;
    if body_end > d.len() - osz {
        bail!("Invalid array framing");
    }
    let framing = d.len() - body_end;
    if framing == 0 || framing % osz != 0 {
        bail!("Invalid array framing");
    }
    let n = framing / osz;
    let mut elems = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let end = read_offset(d, body_end + i * osz, osz)?;
        if end < start || end > body_end {
            bail!("Invalid array element offset");
        }
        elems.push(&d[start..end]);
        start = align_up(end, elem_align);
    }
    Ok(elems)
}

/// Incremental reader for a serialized tuple with a known shape.  The caller
/// states up front how many members are framed (variable-size and not last).
pub(crate) struct TupleReader<'a> {
    d: &'a [u8],
    pos: usize,
    consumed_frames: usize,
    n_frames: usize,
    osz: usize,
}

impl<'a> TupleReader<'a> {
    pub(crate) fn new(d: &'a [u8], n_frames: usize) -> Self {
        let osz = if n_frames == 0 { 0 } else { offset_size(d.len()) };
        Self {
            d,
            pos: 0,
            consumed_frames: 0,
            n_frames,
            osz,
        }
    }

    fn body_end(&self) -> usize {
        self.d.len() - self.n_frames * self.osz
    }

    /// Read a fixed-size member.
    pub(crate) fn fixed(&mut self, size: usize, align: usize) -> Result<&'a [u8]> {
        let start = align_up(self.pos, align);
        let end = start + size;
        if end > self.body_end() {
            bail!("Truncated tuple");
        }
        self.pos = end;
        Ok(&self.d[start..end])
    }

    /// Read a framed (variable-size, non-final) member.
    pub(crate) fn variable(&mut self, align: usize) -> Result<&'a [u8]> {
        if self.consumed_frames == self.n_frames {
            bail!("Tuple shape mismatch");
        }
        let start = align_up(self.pos, align);
        let off_pos = self.d.len() - (self.consumed_frames + 1) * self.osz;
        let end = read_offset(self.d, off_pos, self.osz)?;
        self.consumed_frames += 1;
        if end < start || end > self.body_end() {
            bail!("Invalid tuple member offset");
        }
        self.pos = end;
        Ok(&self.d[start..end])
    }

    /// Read the final member, which extends to the end of the body.
    pub(crate) fn last(&mut self, align: usize) -> Result<&'a [u8]> {
        let start = align_up(self.pos, align);
        let end = self.body_end();
        if start > end {
            bail!("Truncated tuple");
        }
        self.pos = end;
        Ok(&self.d[start..end])
    }
}

/// A NUL-terminated UTF-8 string member.
pub(crate) fn serialize_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 1);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

pub(crate) fn parse_string(d: &[u8]) -> Result<String> {
    let Some((&0, content)) = d.split_last() else {
        bail!("String not NUL terminated");
    };
    if content.contains(&0) {
        bail!("String contains embedded NUL");
    }
    Ok(std::str::from_utf8(content)?.to_string())
}

/// Split variant framing into (type string, value bytes).
pub(crate) fn split_variant(d: &[u8]) -> Result<(&str, &[u8])> {
    let sep = d
        .iter()
        .rposition(|&b| b == 0)
        .ok_or_else(|| anyhow!("Invalid variant framing"))?;
    let typestr = std::str::from_utf8(&d[sep + 1..])?;
    if typestr.is_empty() {
        bail!("Invalid empty variant type");
    }
    Ok((typestr, &d[..sep]))
}

/// Serialize an `a{sv}` dictionary with sorted keys.
pub(crate) fn serialize_dict(dict: &VariantDict) -> Vec<u8> {
    let elems = dict
        .iter()
        .map(|(k, v)| {
            serialize_tuple(vec![
                Member::variable(serialize_string(k), 1),
                Member::variable(v.to_variant_bytes(), 8),
            ])
        })
        .collect();
    serialize_var_array(elems, 8)
}

/// Parse an `a{sv}` dictionary.
pub(crate) fn parse_dict(d: &[u8]) -> Result<VariantDict> {
    let mut out = VariantDict::new();
    for entry in split_var_array(d, 8)? {
        let mut t = TupleReader::new(entry, 1);
        let key = parse_string(t.variable(1)?)?;
        let (typestr, data) = split_variant(t.last(8)?)?;
        out.insert(key, Variant::from_bytes(typestr, data)?);
    }
    Ok(out)
}
