use crate::{OpCode, StringTable, Value, MAX_CHUNK_CONSTANTS};

/// A nested user function compiled into its parent chunk: the body, the
/// lowercased name it is called by, its parameter names and the full list
/// of frame locals (parameters first, then `local` declarations).
#[derive(Debug, Default, Clone)]
pub struct Function {
    /// Lowercased call name.
    pub name: String,
    /// Parameter names, in declaration order.
    pub params: Vec<String>,
    /// Every frame local: the parameters followed by declared locals.
    pub locals: Vec<String>,
    /// The compiled body.
    pub chunk: Chunk,
}

/// A chunk holds a run of bytecode, the constants it references, one source
/// line per code byte and the nested function chunks declared inside it.
/// Chunks are immutable once compilation completes.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    code: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Value>,
    functions: Vec<Function>,
}

impl Chunk {
    /// Append a raw byte with its source line.
    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Append an opcode byte with its source line.
    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_byte(op as u8, line);
    }

    /// Replace an already-written byte (jump patching).
    pub fn patch_byte(&mut self, at: usize, byte: u8) {
        self.code[at] = byte;
    }

    /// Drop code bytes past `len` (peephole rewrites).
    pub fn truncate_code(&mut self, len: usize) {
        self.code.truncate(len);
        self.lines.truncate(len);
    }

    /// The bytecode.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Source line of the code byte at `offset`; line 1 when unknown
    /// (chunks loaded from the cache do not persist lines).
    pub fn line(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(1)
    }

    /// Add a constant, deduplicating against the existing pool. `None` when
    /// the pool is full.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if let Some(at) = self.constants.iter().position(|c| *c == value) {
            return Some(at as u8);
        }
        if self.constants.len() >= MAX_CHUNK_CONSTANTS {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u8)
    }

    /// Read the constant at the given pool index.
    pub fn constant(&self, idx: u8) -> Option<Value> {
        self.constants.get(idx as usize).copied()
    }

    /// The whole constant pool.
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Register a nested function and return its index.
    pub fn add_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    /// The nested functions.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Mutable access to the nested functions (jump threading walks them).
    pub(crate) fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    /// Index of the nested function with the given lowercased name.
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Rebuild a chunk from its serialized parts; lines reset to 1.
    pub(crate) fn from_parts(
        code: Vec<u8>,
        constants: Vec<Value>,
        functions: Vec<Function>,
    ) -> Self {
        let lines = vec![1; code.len()];
        Self {
            code,
            lines,
            constants,
            functions,
        }
    }
}

/// Go through the instructions in the chunk and print them in
/// human-readable format.
#[cfg(debug_assertions)]
pub fn disassemble_chunk(chunk: &Chunk, name: &str, strings: &StringTable) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code().len() {
        offset = disassemble_instruction(chunk, offset, strings);
    }
    for function in chunk.functions() {
        disassemble_chunk(&function.chunk, &function.name, strings);
    }
}

/// Print one instruction and return the offset of the next one.
#[cfg(debug_assertions)]
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, strings: &StringTable) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line(offset));
    }

    let code = chunk.code();
    let op = match OpCode::from_byte(code[offset]) {
        Some(op) => op,
        None => {
            println!("?? {:#04x}", code[offset]);
            return offset + 1;
        }
    };

    let operand = |at: usize| code.get(at).copied().unwrap_or(0);
    let describe_const = |idx: u8| match chunk.constant(idx) {
        Some(v) if v.is_string() => format!("{}", strings.get(v.as_handle())),
        Some(v) => format!("{:?}", v),
        None => "<missing>".to_string(),
    };

    match op.operand_width() {
        0 => println!("{}", op.mnemonic()),
        1 => {
            let a = operand(offset + 1);
            match op {
                OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal => {
                    println!("{:-24} {:4} {}", op.mnemonic(), a, describe_const(a));
                }
                _ => println!("{:-24} {:4}", op.mnemonic(), a),
            }
        }
        _ => {
            let a = operand(offset + 1);
            let b = operand(offset + 2);
            match op {
                OpCode::CallHost | OpCode::TailCall => {
                    println!(
                        "{:-24} {:4} {:4} {}",
                        op.mnemonic(),
                        a,
                        b,
                        describe_const(a)
                    );
                }
                _ => println!("{:-24} {:4} {:4}", op.mnemonic(), a, b),
            }
        }
    }
    offset + 1 + op.operand_width()
}
