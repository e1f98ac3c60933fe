//! Source-to-bytecode cache: little-endian serialization of compiled
//! chunks into `.nsc` files.
//!
//! A cache file opens with the magic `0x4E534300` ("NSC\0"), the format
//! version and the modification timestamp of the source it was compiled
//! from. A file whose timestamp is older than the current source is stale
//! and rejected, which makes the caller recompile. String constants are
//! stored by contents and re-interned on load; line numbers are not
//! persisted, so loaded chunks report line 1 everywhere.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::{Chunk, Function, StringTable, Value, ValueType, MAX_CHUNK_CONSTANTS};

/// File magic, "NSC\0" read as a little-endian u32.
pub const MAGIC: u32 = 0x4E53_4300;

/// Current cache format version. Any layout change bumps this.
pub const VERSION: u16 = 2;

const CONST_BOOL: u8 = 0;
const CONST_INT: u8 = 1;
const CONST_FLOAT: u8 = 2;
const CONST_STRING: u8 = 3;

/// Why a cache file was rejected. Every variant means "recompile from
/// source"; they differ only for diagnostics.
#[derive(Debug)]
pub enum CacheError {
    /// The file could not be read or written.
    Io(io::Error),
    /// The first four bytes are not the `.nsc` magic.
    BadMagic,
    /// The file was written by a different format version.
    BadVersion(u16),
    /// The source file changed after the cache was written.
    Stale,
    /// The payload is malformed.
    Corrupt(&'static str),
}

impl std::error::Error for CacheError {}
impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "cache i/o error: {}", err),
            Self::BadMagic => write!(f, "not a bytecode cache file"),
            Self::BadVersion(found) => {
                write!(f, "cache version {} (expected {})", found, VERSION)
            }
            Self::Stale => write!(f, "cache is older than the source file"),
            Self::Corrupt(what) => write!(f, "corrupt cache: {}", what),
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Serialize a chunk (with its nested functions) to `path`, stamped with
/// the source file's modification time.
pub fn save(
    path: &Path,
    chunk: &Chunk,
    strings: &StringTable,
    source_mtime: u64,
) -> io::Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&source_mtime.to_le_bytes());
    write_chunk(&mut buf, chunk, strings)?;
    fs::write(path, buf)
}

/// Load a chunk from `path`. The caller passes the current modification
/// time of the source file; a cache stamped older than it is rejected as
/// [`CacheError::Stale`]. String constants are re-interned into `strings`.
pub fn load(path: &Path, strings: &mut StringTable, source_mtime: u64) -> Result<Chunk, CacheError> {
    let data = fs::read(path)?;
    let mut r = Reader { data: &data, at: 0 };

    if r.u32()? != MAGIC {
        return Err(CacheError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(CacheError::BadVersion(version));
    }
    let cached_mtime = r.u64()?;
    if source_mtime > cached_mtime {
        return Err(CacheError::Stale);
    }
    read_chunk(&mut r, strings)
}

fn write_chunk(buf: &mut Vec<u8>, chunk: &Chunk, strings: &StringTable) -> io::Result<()> {
    let constants = chunk.constants();
    buf.extend_from_slice(&(constants.len() as u32).to_le_bytes());
    for value in constants {
        match value.kind() {
            ValueType::Bool => {
                buf.push(CONST_BOOL);
                buf.push(value.as_boolean() as u8);
            }
            ValueType::Int => {
                buf.push(CONST_INT);
                buf.extend_from_slice(&value.as_integer().to_le_bytes());
            }
            ValueType::Float => {
                buf.push(CONST_FLOAT);
                buf.extend_from_slice(&value.as_floating().to_le_bytes());
            }
            ValueType::Str => {
                buf.push(CONST_STRING);
                write_str(buf, strings.get(value.as_handle()));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "constant pools hold only booleans, numbers and strings",
                ));
            }
        }
    }

    buf.extend_from_slice(&(chunk.code().len() as u32).to_le_bytes());
    buf.extend_from_slice(chunk.code());

    let functions = chunk.functions();
    buf.extend_from_slice(&(functions.len() as u32).to_le_bytes());
    for function in functions {
        write_str(buf, &function.name);
        buf.extend_from_slice(&(function.params.len() as u32).to_le_bytes());
        for param in &function.params {
            write_str(buf, param);
        }
        buf.extend_from_slice(&(function.locals.len() as u32).to_le_bytes());
        for local in &function.locals {
            write_str(buf, local);
        }
        write_chunk(buf, &function.chunk, strings)?;
    }
    Ok(())
}

fn read_chunk(r: &mut Reader<'_>, strings: &mut StringTable) -> Result<Chunk, CacheError> {
    let constants_count = r.u32()? as usize;
    if constants_count > MAX_CHUNK_CONSTANTS {
        return Err(CacheError::Corrupt("constant pool too large"));
    }
    let mut constants = Vec::with_capacity(constants_count);
    for _ in 0..constants_count {
        let value = match r.u8()? {
            CONST_BOOL => Value::boolean(r.u8()? != 0),
            CONST_INT => Value::integer(r.i64()?),
            CONST_FLOAT => Value::floating(r.f64()?),
            CONST_STRING => {
                let text = r.str()?;
                Value::string(strings.intern(&text))
            }
            _ => return Err(CacheError::Corrupt("unknown constant type")),
        };
        constants.push(value);
    }

    let code_size = r.u32()? as usize;
    let code = r.bytes(code_size)?.to_vec();

    let functions_count = r.u32()? as usize;
    let mut functions = Vec::with_capacity(functions_count.min(256));
    for _ in 0..functions_count {
        let name = r.str()?;
        let params_count = r.u32()? as usize;
        if params_count > 256 {
            return Err(CacheError::Corrupt("too many parameters"));
        }
        let mut params = Vec::with_capacity(params_count);
        for _ in 0..params_count {
            params.push(r.str()?);
        }
        let locals_count = r.u32()? as usize;
        if locals_count > 256 {
            return Err(CacheError::Corrupt("too many locals"));
        }
        let mut locals = Vec::with_capacity(locals_count);
        for _ in 0..locals_count {
            locals.push(r.str()?);
        }
        let chunk = read_chunk(r, strings)?;
        functions.push(Function {
            name,
            params,
            locals,
            chunk,
        });
    }

    Ok(Chunk::from_parts(code, constants, functions))
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CacheError> {
        let end = self
            .at
            .checked_add(n)
            .ok_or(CacheError::Corrupt("length overflow"))?;
        if end > self.data.len() {
            return Err(CacheError::Corrupt("unexpected end of file"));
        }
        let out = &self.data[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CacheError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CacheError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CacheError> {
        let b = self.bytes(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_le_bytes(out))
    }

    fn i64(&mut self) -> Result<i64, CacheError> {
        Ok(self.u64()? as i64)
    }

    fn f64(&mut self) -> Result<f64, CacheError> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn str(&mut self) -> Result<String, CacheError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CacheError::Corrupt("invalid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("nightscript-cache-{}-{}", std::process::id(), name));
        path
    }

    fn assert_chunks_match(a: &Chunk, b: &Chunk, sa: &StringTable, sb: &StringTable) {
        assert_eq!(a.code(), b.code());
        assert_eq!(a.constants().len(), b.constants().len());
        for (ca, cb) in a.constants().iter().zip(b.constants()) {
            match (ca.kind(), cb.kind()) {
                // string handles may differ between interners; compare text
                (ValueType::Str, ValueType::Str) => {
                    assert_eq!(sa.get(ca.as_handle()), sb.get(cb.as_handle()));
                }
                _ => assert_eq!(ca, cb),
            }
        }
        assert_eq!(a.functions().len(), b.functions().len());
        for (fa, fb) in a.functions().iter().zip(b.functions()) {
            assert_eq!(fa.name, fb.name);
            assert_eq!(fa.params, fb.params);
            assert_eq!(fa.locals, fb.locals);
            assert_chunks_match(&fa.chunk, &fb.chunk, sa, sb);
        }
    }

    #[test]
    fn chunks_round_trip_through_the_cache() {
        let src = "\
x = 1.5
s = \"hello\"
function add(a, b)
  local sum
  sum = a + b
  return sum
end
function outer()
  function inner(q)
    return q
  end
  return inner(1)
end
print add(1, 2)
";
        let mut strings = StringTable::default();
        let chunk = compile(src, &mut strings).unwrap();

        let path = scratch_path("roundtrip.nsc");
        save(&path, &chunk, &strings, 100).unwrap();

        let mut loaded_strings = StringTable::default();
        let loaded = load(&path, &mut loaded_strings, 100).unwrap();
        assert_chunks_match(&chunk, &loaded, &strings, &loaded_strings);
        // lines are not persisted
        assert_eq!(loaded.line(0), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stale_caches_are_rejected() {
        let mut strings = StringTable::default();
        let chunk = compile("x = 1\n", &mut strings).unwrap();
        let path = scratch_path("stale.nsc");
        save(&path, &chunk, &strings, 100).unwrap();

        let mut loaded_strings = StringTable::default();
        assert!(matches!(
            load(&path, &mut loaded_strings, 101),
            Err(CacheError::Stale)
        ));
        // equal or newer cache stamps pass
        assert!(load(&path, &mut loaded_strings, 100).is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let path = scratch_path("magic.nsc");
        std::fs::write(&path, b"not a cache file").unwrap();
        let mut strings = StringTable::default();
        assert!(matches!(
            load(&path, &mut strings, 0),
            Err(CacheError::BadMagic)
        ));

        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, &buf).unwrap();
        assert!(matches!(
            load(&path, &mut strings, 0),
            Err(CacheError::BadVersion(1))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_payloads_are_corrupt_not_panics() {
        let mut strings = StringTable::default();
        let chunk = compile("x = \"abc\"\n", &mut strings).unwrap();
        let path = scratch_path("truncated.nsc");
        save(&path, &chunk, &strings, 0).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 3);
        std::fs::write(&path, &data).unwrap();

        let mut loaded_strings = StringTable::default();
        assert!(matches!(
            load(&path, &mut loaded_strings, 0),
            Err(CacheError::Corrupt(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn loaded_string_constants_are_interned() {
        let mut strings = StringTable::default();
        let chunk = compile("s = \"twice\"\nt = \"twice\"\n", &mut strings).unwrap();
        let path = scratch_path("intern.nsc");
        save(&path, &chunk, &strings, 0).unwrap();

        let mut loaded_strings = StringTable::default();
        let loaded = load(&path, &mut loaded_strings, 0).unwrap();
        let ids: Vec<u32> = loaded
            .constants()
            .iter()
            .filter(|v| v.is_string())
            .map(|v| v.as_handle())
            .collect();
        for &id in &ids {
            let text = loaded_strings.get(id);
            assert_eq!(loaded_strings.find_id(text), id);
        }
        let _ = std::fs::remove_file(&path);
    }
}
