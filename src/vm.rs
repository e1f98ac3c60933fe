use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};

use rustc_hash::FxHashMap;

use crate::{
    Chunk, Error, Function, GcStats, Heap, HostEnvironment, OpCode, RuntimeError, Value, ValueType,
    GC_THRESHOLD, MAX_FRAMES, MAX_STACK, STRING_NOT_FOUND,
};

/// One entry of the call stack: where the frame's locals start on the value
/// stack, where they end, the caller's instruction pointer and the stack
/// height the return value replaces.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    base: usize,
    locals_end: usize,
    #[allow(dead_code)]
    return_ip: usize,
    saved_top: usize,
}

/// A stack-based bytecode virtual machine for NightScript.
///
/// The VM owns the value stack, the call frames, the globals and the whole
/// heap-object universe. It is single-threaded and not reentrant; embedding
/// it in a multi-threaded host requires one VM per thread or external
/// serialization.
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) globals_by_id: FxHashMap<u32, Value>,
    pub(crate) heap: Heap,
    op_counts: Box<[u64; 256]>,
    pub(crate) gc_stats: GcStats,
    pub(crate) bytes_allocated_since_gc: usize,
    interrupted: bool,
    line: u32,
    out: Box<dyn Write>,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VM")
            .field("stack_depth", &self.stack.len())
            .field("call_depth", &self.frames.len())
            .field("globals", &self.globals.len())
            .field("gc_stats", &self.gc_stats)
            .finish()
    }
}

impl VM {
    /// A VM that prints to standard output.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// A VM whose `print` statements write to the given sink.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: HashMap::default(),
            globals_by_id: FxHashMap::default(),
            heap: Heap::default(),
            op_counts: Box::new([0; 256]),
            gc_stats: GcStats::default(),
            bytes_allocated_since_gc: 0,
            interrupted: false,
            line: 1,
            out,
        }
    }

    /// The heap-object tables.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable access to the heap-object tables (the compiler interns
    /// through `heap_mut().strings`).
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Current call depth.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Write a global. The by-name and by-id indices are one logical map;
    /// both are updated.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let id = self.heap.strings.intern(name);
        self.globals_by_id.insert(id, value);
        self.globals.insert(name.to_owned(), value);
    }

    /// Read a global, `nil` when undefined.
    pub fn get_global(&self, name: &str) -> Value {
        let id = self.heap.strings.find_id(name);
        if id != STRING_NOT_FOUND {
            if let Some(&value) = self.globals_by_id.get(&id) {
                return value;
            }
        }
        self.globals.get(name).copied().unwrap_or(Value::nil())
    }

    /// Signal the VM to stop; observed between opcode dispatches. There is
    /// no other way to cancel a running script.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// How many times an opcode has been dispatched since the last
    /// [`VM::reset_stats`].
    pub fn op_count(&self, op: OpCode) -> u64 {
        self.op_counts[op as u8 as usize]
    }

    /// Zero the per-opcode counters and the GC statistics.
    pub fn reset_stats(&mut self) {
        self.op_counts = Box::new([0; 256]);
        self.gc_stats = GcStats::default();
    }

    /// Garbage collection statistics.
    pub fn gc_stats(&self) -> &GcStats {
        &self.gc_stats
    }

    /// Run a compiled chunk to completion. On a runtime error a single
    /// `[line N] Error: message` line goes to stderr, the stack is reset
    /// and `Error::Runtime` is returned; the VM can be reused afterwards.
    pub fn execute(&mut self, chunk: &Chunk, host: &mut dyn HostEnvironment) -> Result<(), Error> {
        self.stack.clear();
        self.frames.clear();
        self.interrupted = false;
        match self.run(chunk, None, chunk, host) {
            Ok(()) => Ok(()),
            Err(err) => {
                eprintln!("[line {}] Error: {}", self.line, err);
                self.stack.clear();
                self.frames.clear();
                Err(Error::Runtime)
            }
        }
    }

    /// The dispatch loop. `parent` is the chunk one call level up (for
    /// function lookup); `top` is the program chunk, whose constant pools
    /// root the collector.
    ///
    /// Dispatch is a single dense `match` over the opcode byte: the
    /// discriminants are contiguous from zero, so this lowers to a jump
    /// table with one branch site per opcode rather than a chain of
    /// comparisons.
    fn run(
        &mut self,
        chunk: &Chunk,
        parent: Option<&Chunk>,
        top: &Chunk,
        host: &mut dyn HostEnvironment,
    ) -> Result<(), RuntimeError> {
        let code = chunk.code();
        let mut ip = 0usize;

        while ip < code.len() {
            if self.interrupted {
                return Err(RuntimeError::Interrupted);
            }
            if self.bytes_allocated_since_gc > GC_THRESHOLD {
                self.collect_garbage(top);
            }

            let byte = code[ip];
            self.line = chunk.line(ip);
            self.op_counts[byte as usize] += 1;
            ip += 1;
            let op = OpCode::from_byte(byte).ok_or(RuntimeError::UnknownOpcode(byte))?;

            match op {
                OpCode::Constant => {
                    let value = read_constant(chunk, code, &mut ip)?;
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::nil())?,
                OpCode::True => self.push(Value::boolean(true))?,
                OpCode::False => self.push(Value::boolean(false))?,

                OpCode::GetGlobal => {
                    let name = read_constant(chunk, code, &mut ip)?;
                    if !name.is_string() {
                        return Err(RuntimeError::InvalidOperands("Expected variable name"));
                    }
                    let id = name.as_handle();
                    let value = match self.globals_by_id.get(&id) {
                        Some(&value) => value,
                        None => {
                            let text = self.heap.strings.get(id);
                            self.globals.get(text).copied().unwrap_or(Value::nil())
                        }
                    };
                    self.push(value)?;
                }
                OpCode::SetGlobal => {
                    let name = read_constant(chunk, code, &mut ip)?;
                    if !name.is_string() {
                        return Err(RuntimeError::InvalidOperands("Expected variable name"));
                    }
                    let id = name.as_handle();
                    // assignment is an expression, the value stays put
                    let value = self.peek(0)?;
                    self.globals_by_id.insert(id, value);
                    let text = self.heap.strings.get(id).to_owned();
                    self.globals.insert(text, value);
                }
                OpCode::GetLocal => {
                    let slot = read_byte(code, &mut ip)?;
                    let frame = self.current_frame(slot)?;
                    let at = frame.base + slot as usize;
                    if at >= frame.locals_end {
                        return Err(RuntimeError::LocalSlotOutOfRange(slot));
                    }
                    let value = self.stack[at];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = read_byte(code, &mut ip)?;
                    let frame = self.current_frame(slot)?;
                    let at = frame.base + slot as usize;
                    if at >= frame.locals_end {
                        return Err(RuntimeError::LocalSlotOutOfRange(slot));
                    }
                    self.stack[at] = self.peek(0)?;
                }

                OpCode::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let value = if a.is_string() || a.is_buffer() || b.is_string() || b.is_buffer()
                    {
                        self.concat(a, b)?
                    } else {
                        generic_arith(op, a, b)?
                    };
                    self.push(value)?;
                }
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide | OpCode::Modulo => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let value = generic_arith(op, a, b)?;
                    self.push(value)?;
                }

                OpCode::AddInt => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::integer(a.as_integer().wrapping_add(b.as_integer())))?;
                }
                OpCode::AddFloat => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::floating(a.as_floating() + b.as_floating()))?;
                }
                OpCode::AddString => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let value = self.concat(a, b)?;
                    self.push(value)?;
                }
                OpCode::SubInt => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::integer(a.as_integer().wrapping_sub(b.as_integer())))?;
                }
                OpCode::SubFloat => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::floating(a.as_floating() - b.as_floating()))?;
                }
                OpCode::MulInt => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::integer(a.as_integer().wrapping_mul(b.as_integer())))?;
                }
                OpCode::MulFloat => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::floating(a.as_floating() * b.as_floating()))?;
                }
                OpCode::DivInt => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if b.as_integer() == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    self.push(Value::integer(a.as_integer().wrapping_div(b.as_integer())))?;
                }
                OpCode::DivFloat => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if b.as_floating() == 0.0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    self.push(Value::floating(a.as_floating() / b.as_floating()))?;
                }
                OpCode::ModInt => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if b.as_integer() == 0 {
                        return Err(RuntimeError::ModuloByZero);
                    }
                    self.push(Value::integer(a.as_integer().wrapping_rem(b.as_integer())))?;
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::boolean(a == b))?;
                }
                OpCode::Greater | OpCode::GreaterEqual | OpCode::LessEqual | OpCode::Less => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::boolean(compare(op, a, b)))?;
                }
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::boolean(value.is_falsey()))?;
                }

                OpCode::Jump => {
                    let offset = read_byte(code, &mut ip)?;
                    ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_byte(code, &mut ip)?;
                    let condition = self.pop()?;
                    if condition.is_falsey() {
                        ip += offset as usize;
                    }
                }
                OpCode::JumpBack => {
                    let offset = read_byte(code, &mut ip)?;
                    ip = ip
                        .checked_sub(offset as usize)
                        .ok_or(RuntimeError::TruncatedBytecode)?;
                }

                OpCode::CallHost => {
                    let name = read_constant(chunk, code, &mut ip)?;
                    let argc = read_byte(code, &mut ip)? as usize;
                    if !name.is_string() {
                        return Err(RuntimeError::InvalidOperands("Expected function name"));
                    }
                    let name = self.heap.strings.get(name.as_handle()).to_owned();
                    let lower = name.to_lowercase();
                    let start = self
                        .stack
                        .len()
                        .checked_sub(argc)
                        .ok_or(RuntimeError::StackUnderflow)?;

                    // values escape the VM here, so buffers flatten
                    let mut args: Vec<Value> = self.stack[start..].to_vec();
                    for arg in &mut args {
                        *arg = self.flatten(*arg);
                    }

                    if let Some(ret) = host.call(&lower, &args) {
                        self.stack.truncate(start);
                        self.push(ret)?;
                    } else if let Some(idx) = chunk.function_index(&lower) {
                        self.call_user(&chunk.functions()[idx], chunk, top, host, start, ip)?;
                    } else if let Some(idx) = parent.and_then(|p| p.function_index(&lower)) {
                        let up = parent.expect("index came from the parent");
                        self.call_user(&up.functions()[idx], up, top, host, start, ip)?;
                    } else if let Some(result) = self.intrinsic(&lower, &args) {
                        let ret = result?;
                        self.stack.truncate(start);
                        self.push(ret)?;
                    } else {
                        return Err(RuntimeError::UnknownFunction(name));
                    }
                }
                OpCode::TailCall => {
                    // the name operand is diagnostics only: the compiler
                    // emits TAIL_CALL solely for self-recursion
                    let _name = read_constant(chunk, code, &mut ip)?;
                    let argc = read_byte(code, &mut ip)? as usize;
                    let frame = self.frames.last().copied().ok_or(
                        RuntimeError::InvalidOperands("Tail call outside of a function"),
                    )?;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(argc)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    let locals = frame.locals_end - frame.base;
                    let kept = argc.min(locals);
                    for i in 0..kept {
                        self.stack[frame.base + i] = self.stack[start + i];
                    }
                    for at in (frame.base + kept)..frame.locals_end {
                        self.stack[at] = Value::nil();
                    }
                    self.stack.truncate(frame.locals_end);
                    ip = 0;
                }
                OpCode::Return => {
                    // the return value, if any, stays on top for the caller
                    return Ok(());
                }

                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    let text = self.stringify(value);
                    let _ = writeln!(self.out, "{}", text);
                }
                OpCode::PrintSpace => {
                    let value = self.pop()?;
                    let text = self.stringify(value);
                    let _ = write!(self.out, "{} ", text);
                }

                OpCode::AddLocal | OpCode::AddFloatLocal | OpCode::AddStringLocal => {
                    let slot_a = read_byte(code, &mut ip)?;
                    let slot_b = read_byte(code, &mut ip)?;
                    let a = self.local(slot_a)?;
                    let b = self.local(slot_b)?;
                    let value = match op {
                        OpCode::AddLocal => {
                            Value::integer(a.as_integer().wrapping_add(b.as_integer()))
                        }
                        OpCode::AddFloatLocal => Value::floating(as_number(a) + as_number(b)),
                        _ => self.concat(a, b)?,
                    };
                    self.push(value)?;
                }
                OpCode::AddLocalConst | OpCode::AddLocalConstFloat => {
                    let slot = read_byte(code, &mut ip)?;
                    let a = self.local(slot)?;
                    let k = read_constant(chunk, code, &mut ip)?;
                    let value = if op == OpCode::AddLocalConst {
                        Value::integer(a.as_integer().wrapping_add(k.as_integer()))
                    } else {
                        Value::floating(as_number(a) + as_number(k))
                    };
                    self.push(value)?;
                }
                OpCode::AddConstLocal | OpCode::AddConstLocalFloat => {
                    let k = read_constant(chunk, code, &mut ip)?;
                    let slot = read_byte(code, &mut ip)?;
                    let a = self.local(slot)?;
                    let value = if op == OpCode::AddConstLocal {
                        Value::integer(k.as_integer().wrapping_add(a.as_integer()))
                    } else {
                        Value::floating(as_number(k) + as_number(a))
                    };
                    self.push(value)?;
                }

                OpCode::ArrayCreate => {
                    let count = read_byte(code, &mut ip)? as usize;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(count)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    let items = self.stack.split_off(start);
                    let id = self.heap.arrays.create_from(items);
                    self.push(Value::array(id))?;
                }
                OpCode::ArrayGet => {
                    let index = self.pop()?;
                    let array = self.pop()?;
                    let value = self.array_get(array, index)?;
                    self.push(value)?;
                }
                OpCode::ArraySet => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let array = self.pop()?;
                    self.array_set(array, index, value)?;
                }
                OpCode::ArrayLength => {
                    let array = self.pop()?;
                    let id = expect_array(array)?;
                    self.push(Value::integer(self.heap.arrays.length(id) as i64))?;
                }
                OpCode::ArrayPush => {
                    let value = self.pop()?;
                    let array = self.pop()?;
                    let id = expect_array(array)?;
                    self.heap.arrays.push_back(id, value);
                }
                OpCode::ArrayPop => {
                    let array = self.pop()?;
                    let id = expect_array(array)?;
                    let value = self.heap.arrays.pop_back(id).unwrap_or_else(Value::nil);
                    self.push(value)?;
                }

                OpCode::TableCreate => {
                    let id = self.heap.tables.create();
                    self.push(Value::table(id))?;
                }
                OpCode::TableGet => {
                    let key = self.pop()?;
                    let table = self.pop()?;
                    let id = expect_table(table)?;
                    let key = self.table_key(key)?;
                    let value = self.heap.tables.get(id, key).unwrap_or_else(Value::nil);
                    self.push(value)?;
                }
                OpCode::TableSet => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let table = self.peek(0)?;
                    let id = expect_table(table)?;
                    let key = self.table_key(key)?;
                    self.heap.tables.set(id, key, value);
                }
                OpCode::TableHas => {
                    let key = self.pop()?;
                    let table = self.pop()?;
                    let id = expect_table(table)?;
                    let key = self.table_key(key)?;
                    self.push(Value::boolean(self.heap.tables.has(id, key)))?;
                }
                OpCode::TableKeys => {
                    let table = self.pop()?;
                    let id = expect_table(table)?;
                    let keys = self.sorted_keys(id);
                    let items: Vec<Value> = keys.into_iter().map(Value::string).collect();
                    let array = self.heap.arrays.create_from(items);
                    self.push(Value::array(array))?;
                }
                OpCode::TableValues => {
                    let table = self.pop()?;
                    let id = expect_table(table)?;
                    let keys = self.sorted_keys(id);
                    let items: Vec<Value> = keys
                        .into_iter()
                        .map(|k| self.heap.tables.get(id, k).unwrap_or_else(Value::nil))
                        .collect();
                    let array = self.heap.arrays.create_from(items);
                    self.push(Value::array(array))?;
                }
                OpCode::TableSize => {
                    let table = self.pop()?;
                    let id = expect_table(table)?;
                    self.push(Value::integer(self.heap.tables.size(id) as i64))?;
                }
                OpCode::TableRemove => {
                    let key = self.pop()?;
                    let table = self.pop()?;
                    let id = expect_table(table)?;
                    let key = self.table_key(key)?;
                    self.heap.tables.remove(id, key);
                }

                OpCode::IndexGet => {
                    let index = self.pop()?;
                    let container = self.pop()?;
                    let value = match container.kind() {
                        ValueType::Array => self.array_get(container, index)?,
                        ValueType::Table => {
                            let key = self.table_key(index)?;
                            self.heap
                                .tables
                                .get(container.as_handle(), key)
                                .unwrap_or_else(Value::nil)
                        }
                        _ => {
                            return Err(RuntimeError::InvalidOperands(
                                "Only arrays and tables can be indexed",
                            ))
                        }
                    };
                    self.push(value)?;
                }
                OpCode::IndexSet => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let container = self.pop()?;
                    match container.kind() {
                        ValueType::Array => self.array_set(container, index, value)?,
                        ValueType::Table => {
                            let key = self.table_key(index)?;
                            self.heap.tables.set(container.as_handle(), key, value);
                        }
                        _ => {
                            return Err(RuntimeError::InvalidOperands(
                                "Only arrays and tables can be indexed",
                            ))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run a user function: its arguments already sit on the stack starting
    /// at `base` and become the frame's first locals.
    fn call_user(
        &mut self,
        function: &Function,
        parent: &Chunk,
        top: &Chunk,
        host: &mut dyn HostEnvironment,
        base: usize,
        return_ip: usize,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        let locals_end = base + function.locals.len();
        while self.stack.len() < locals_end {
            self.push(Value::nil())?;
        }
        // surplus arguments do not belong to any local
        self.stack.truncate(locals_end);

        let frames_before = self.frames.len();
        self.frames.push(CallFrame {
            base,
            locals_end,
            return_ip,
            saved_top: base,
        });
        let result = self.run(&function.chunk, Some(parent), top, host);
        if self.frames.len() != frames_before + 1 {
            return Err(RuntimeError::FrameImbalance);
        }
        let frame = self.frames.pop().expect("frame pushed above");
        result?;

        let ret = if self.stack.len() > frame.locals_end {
            self.pop()?
        } else {
            Value::nil()
        };
        // a buffer never escapes a function return
        let ret = self.flatten(ret);
        self.stack.truncate(frame.saved_top);
        self.push(ret)?;
        Ok(())
    }

    // ---- the container intrinsics ---------------------------------------

    /// The built-in container functions behind the `add`/`remove`/`clear`/
    /// `length` sugar. They need heap access, which host callables do not
    /// have, so the VM resolves them itself after the host environment and
    /// the user functions have declined the name.
    fn intrinsic(&mut self, name: &str, args: &[Value]) -> Option<Result<Value, RuntimeError>> {
        match name {
            "add" => Some(self.intrinsic_add(args)),
            "remove" => Some(self.intrinsic_remove(args)),
            "clear" => Some(self.intrinsic_clear(args)),
            "length" => Some(self.intrinsic_length(args)),
            _ => None,
        }
    }

    fn intrinsic_add(&mut self, args: &[Value]) -> Result<Value, RuntimeError> {
        let &[value, list] = args else {
            return Err(RuntimeError::InvalidOperands("'add' expects a value and a list"));
        };
        let id = expect_array(list)?;
        self.heap.arrays.push_back(id, value);
        Ok(list)
    }

    fn intrinsic_remove(&mut self, args: &[Value]) -> Result<Value, RuntimeError> {
        let &[list, index] = args else {
            return Err(RuntimeError::InvalidOperands("'remove' expects a list and an index"));
        };
        match list.kind() {
            ValueType::Array => {
                if !index.is_int() {
                    return Err(RuntimeError::InvalidOperands(
                        "Array index must be an integer",
                    ));
                }
                let at = index.as_integer();
                self.heap
                    .arrays
                    .remove_at(list.as_handle(), at)
                    .ok_or(RuntimeError::BadIndex(at))
            }
            ValueType::Table => {
                let key = self.table_key(index)?;
                Ok(self
                    .heap
                    .tables
                    .remove(list.as_handle(), key)
                    .unwrap_or_else(Value::nil))
            }
            _ => Err(RuntimeError::InvalidOperands(
                "'remove' expects an array or a table",
            )),
        }
    }

    fn intrinsic_clear(&mut self, args: &[Value]) -> Result<Value, RuntimeError> {
        let &[list] = args else {
            return Err(RuntimeError::InvalidOperands("'clear' expects a list"));
        };
        match list.kind() {
            ValueType::Array => self.heap.arrays.clear(list.as_handle()),
            ValueType::Table => self.heap.tables.clear(list.as_handle()),
            _ => {
                return Err(RuntimeError::InvalidOperands(
                    "'clear' expects an array or a table",
                ))
            }
        }
        Ok(Value::nil())
    }

    fn intrinsic_length(&mut self, args: &[Value]) -> Result<Value, RuntimeError> {
        let &[value] = args else {
            return Err(RuntimeError::InvalidOperands("'length' expects one value"));
        };
        let len = match value.kind() {
            ValueType::Array => self.heap.arrays.length(value.as_handle()),
            ValueType::Table => self.heap.tables.size(value.as_handle()),
            ValueType::Str => self.heap.strings.get(value.as_handle()).len(),
            ValueType::Buffer => self.heap.buffers.get(value.as_handle()).len(),
            _ => {
                return Err(RuntimeError::InvalidOperands(
                    "'length' expects a container or a string",
                ))
            }
        };
        Ok(Value::integer(len as i64))
    }

    // ---- strings and buffers --------------------------------------------

    /// The concatenation promotion rule:
    /// 1. two interned strings seed a fresh buffer;
    /// 2. buffer + anything appends in place and keeps the same handle;
    /// 3. interned string + buffer seeds a fresh buffer;
    /// 4. any other mix stringifies both sides into a fresh buffer.
    fn concat(&mut self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        if a.is_buffer() {
            let id = a.as_handle();
            let appended = if b.is_string() {
                let Heap {
                    strings, buffers, ..
                } = &mut self.heap;
                buffers.append_from_string(id, b.as_handle(), strings)
            } else if b.is_buffer() {
                // may alias `a` (s = s + s), so copy out first
                let text = self.heap.buffers.get(b.as_handle()).to_owned();
                self.heap.buffers.append_literal(id, &text)
            } else {
                let text = self.stringify(b);
                self.heap.buffers.append_literal(id, &text)
            };
            self.bytes_allocated_since_gc += appended;
            return Ok(a);
        }
        let left = self.stringify(a);
        let right = self.stringify(b);
        self.bytes_allocated_since_gc += left.len() + right.len();
        let id = self.heap.buffers.create_from_two(&left, &right);
        Ok(Value::buffer(id))
    }

    /// Rewrite a buffer handle into an interned string; used whenever a
    /// value escapes the VM (function returns, host-call arguments).
    fn flatten(&mut self, value: Value) -> Value {
        if value.is_buffer() {
            let text = self.heap.buffers.get(value.as_handle()).to_owned();
            Value::string(self.heap.strings.intern(&text))
        } else {
            value
        }
    }

    /// Printable form of any value.
    pub fn stringify(&self, value: Value) -> String {
        match value.kind() {
            ValueType::Nil => "nil".to_string(),
            ValueType::Bool => if value.as_boolean() { "true" } else { "false" }.to_string(),
            ValueType::Int => value.as_integer().to_string(),
            ValueType::Float => float_repr(value.as_floating()),
            ValueType::Str => self.heap.strings.get(value.as_handle()).to_owned(),
            ValueType::Buffer => self.heap.buffers.get(value.as_handle()).to_owned(),
            ValueType::Table => format!("table#{}", value.as_handle()),
            ValueType::Array => format!("array#{}", value.as_handle()),
        }
    }

    fn table_key(&mut self, value: Value) -> Result<u32, RuntimeError> {
        match value.kind() {
            ValueType::Str => Ok(value.as_handle()),
            ValueType::Buffer => {
                let text = self.heap.buffers.get(value.as_handle()).to_owned();
                Ok(self.heap.strings.intern(&text))
            }
            _ => Err(RuntimeError::InvalidOperands("Table keys must be strings")),
        }
    }

    fn array_get(&self, array: Value, index: Value) -> Result<Value, RuntimeError> {
        let id = expect_array(array)?;
        if !index.is_int() {
            return Err(RuntimeError::InvalidOperands(
                "Array index must be an integer",
            ));
        }
        let at = index.as_integer();
        self.heap
            .arrays
            .get(id, at)
            .ok_or(RuntimeError::BadIndex(at))
    }

    fn array_set(&mut self, array: Value, index: Value, value: Value) -> Result<(), RuntimeError> {
        let id = expect_array(array)?;
        if !index.is_int() {
            return Err(RuntimeError::InvalidOperands(
                "Array index must be an integer",
            ));
        }
        let at = index.as_integer();
        if self.heap.arrays.set(id, at, value) {
            Ok(())
        } else {
            Err(RuntimeError::BadIndex(at))
        }
    }

    fn sorted_keys(&self, id: u32) -> Vec<u32> {
        let mut keys = self.heap.tables.keys(id);
        keys.sort_by(|&a, &b| self.heap.strings.get(a).cmp(self.heap.strings.get(b)));
        keys
    }

    // ---- stack plumbing -------------------------------------------------

    /// Roots for the collector: every live stack slot.
    pub(crate) fn stack(&self) -> &[Value] {
        &self.stack
    }

    fn current_frame(&self, slot: u8) -> Result<CallFrame, RuntimeError> {
        self.frames
            .last()
            .copied()
            .ok_or(RuntimeError::LocalSlotOutOfRange(slot))
    }

    fn local(&self, slot: u8) -> Result<Value, RuntimeError> {
        let frame = self.current_frame(slot)?;
        let at = frame.base + slot as usize;
        if at >= frame.locals_end {
            return Err(RuntimeError::LocalSlotOutOfRange(slot));
        }
        Ok(self.stack[at])
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= MAX_STACK {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - distance])
    }
}

fn read_byte(code: &[u8], ip: &mut usize) -> Result<u8, RuntimeError> {
    let byte = *code.get(*ip).ok_or(RuntimeError::TruncatedBytecode)?;
    *ip += 1;
    Ok(byte)
}

fn read_constant(chunk: &Chunk, code: &[u8], ip: &mut usize) -> Result<Value, RuntimeError> {
    let idx = read_byte(code, ip)?;
    chunk.constant(idx).ok_or(RuntimeError::BadConstant(idx))
}

fn expect_array(value: Value) -> Result<u32, RuntimeError> {
    if value.is_array() {
        Ok(value.as_handle())
    } else {
        Err(RuntimeError::InvalidOperands("Expected an array"))
    }
}

fn expect_table(value: Value) -> Result<u32, RuntimeError> {
    if value.is_table() {
        Ok(value.as_handle())
    } else {
        Err(RuntimeError::InvalidOperands("Expected a table"))
    }
}

fn as_number(value: Value) -> f64 {
    if value.is_float() {
        value.as_floating()
    } else {
        value.as_integer() as f64
    }
}

fn generic_arith(op: OpCode, a: Value, b: Value) -> Result<Value, RuntimeError> {
    if a.is_int() && b.is_int() {
        let (x, y) = (a.as_integer(), b.as_integer());
        let v = match op {
            OpCode::Add => x.wrapping_add(y),
            OpCode::Subtract => x.wrapping_sub(y),
            OpCode::Multiply => x.wrapping_mul(y),
            OpCode::Divide => {
                if y == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                x.wrapping_div(y)
            }
            OpCode::Modulo => {
                if y == 0 {
                    return Err(RuntimeError::ModuloByZero);
                }
                x.wrapping_rem(y)
            }
            _ => unreachable!("not an arithmetic opcode"),
        };
        return Ok(Value::integer(v));
    }
    let numeric =
        |v: Value| v.is_int() || v.is_float();
    if numeric(a) && numeric(b) {
        let (x, y) = (as_number(a), as_number(b));
        let v = match op {
            OpCode::Add => x + y,
            OpCode::Subtract => x - y,
            OpCode::Multiply => x * y,
            OpCode::Divide => {
                if y == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                x / y
            }
            OpCode::Modulo => {
                return Err(RuntimeError::InvalidOperands("Operands must be integers"))
            }
            _ => unreachable!("not an arithmetic opcode"),
        };
        return Ok(Value::floating(v));
    }
    Err(RuntimeError::InvalidOperands("Operands must be numbers"))
}

fn compare(op: OpCode, a: Value, b: Value) -> bool {
    // ordering is defined only between two ints or two floats; any other
    // combination is false, not an error
    match (a.kind(), b.kind()) {
        (ValueType::Int, ValueType::Int) => {
            let (x, y) = (a.as_integer(), b.as_integer());
            match op {
                OpCode::Greater => x > y,
                OpCode::GreaterEqual => x >= y,
                OpCode::LessEqual => x <= y,
                OpCode::Less => x < y,
                _ => false,
            }
        }
        (ValueType::Float, ValueType::Float) => {
            let (x, y) = (a.as_floating(), b.as_floating());
            match op {
                OpCode::Greater => x > y,
                OpCode::GreaterEqual => x >= y,
                OpCode::LessEqual => x <= y,
                OpCode::Less => x < y,
                _ => false,
            }
        }
        _ => false,
    }
}

fn float_repr(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.0}", f)
    } else {
        format!("{}", f)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{compile, TableHost};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A cloneable sink so tests can read back what the VM printed.
    #[derive(Clone, Default)]
    pub(crate) struct SharedOut(pub(crate) Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_with_host(src: &str, host: &mut TableHost) -> (String, VM) {
        let out = SharedOut::default();
        let mut vm = VM::with_output(Box::new(out.clone()));
        let chunk = compile(src, &mut vm.heap_mut().strings).expect("source should compile");
        vm.execute(&chunk, host).expect("script should run");
        let text = String::from_utf8(out.0.borrow().clone()).expect("utf-8 output");
        (text, vm)
    }

    fn run(src: &str) -> String {
        run_with_host(src, &mut TableHost::new()).0
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run("print 2 + 3 * 4\nprint (2 + 3) * 4\n"), "14\n20\n");
    }

    #[test]
    fn globals_and_conditionals() {
        let src = "\
x = 10
if x > 5 then
  print \"big\"
else
  print \"small\"
end
";
        assert_eq!(run(src), "big\n");
    }

    #[test]
    fn elseif_chains() {
        let src = "\
x = 4
if x > 5 then
  print \"big\"
elseif x > 2 then
  print \"mid\"
else
  print \"small\"
end
";
        assert_eq!(run(src), "mid\n");
    }

    #[test]
    fn while_loops_and_concatenation() {
        let src = "\
i = 0
s = \"\"
while i < 3 do
  s = s + \"ab\"
  i = i + 1
end
print s
";
        assert_eq!(run(src), "ababab\n");
    }

    #[test]
    fn functions_with_parameters() {
        let src = "\
function add(a, b)
  return a + b
end
print add(7, 35)
";
        assert_eq!(run(src), "42\n");
    }

    #[test]
    fn tail_recursive_countdown_runs_in_constant_frames() {
        let src = "\
function count(n)
  if n == 0 then return \"done\" end
  return count(n - 1)
end
print count(5000)
";
        assert_eq!(run(src), "done\n");
    }

    #[test]
    fn arrays_and_length_sugar() {
        let src = "\
xs = { 10, 20, 30 }
print xs[0]
print xs[-1]
print length of xs
";
        assert_eq!(run(src), "10\n30\n3\n");
    }

    #[test]
    fn container_sugar_round_trip() {
        let src = "\
xs = { 1, 2 }
add 9 to xs
print length of xs
print xs[-1]
remove xs[0]
print xs[0]
clear xs
print length of xs
";
        assert_eq!(run(src), "3\n9\n2\n0\n");
    }

    #[test]
    fn tables_store_and_report() {
        let src = "\
t = { name: \"elm\", kind: \"tree\" }
print t[\"name\"]
t[\"age\"] = 300
print t[\"age\"]
print length of t
";
        assert_eq!(run(src), "elm\n300\n3\n");
    }

    #[test]
    fn print_joins_values_with_spaces() {
        assert_eq!(run("print 1 2 \"three\"\n"), "1 2 three\n");
    }

    #[test]
    fn logical_operators_short_circuit() {
        let src = "\
print true and 5
print false and crash()
print false or 7
print true or crash()
";
        assert_eq!(run(src), "5\nfalse\n7\ntrue\n");
    }

    #[test]
    fn comparisons_between_mixed_kinds_are_false() {
        assert_eq!(run("print 1 == 1.0\nprint 1 < 1.5\n"), "false\nfalse\n");
        assert_eq!(run("print 2 < 3\nprint 2.5 <= 2.5\n"), "true\ntrue\n");
    }

    #[test]
    fn equality_on_interned_strings_is_by_handle() {
        assert_eq!(run("print \"ab\" == \"ab\"\nprint \"ab\" == \"cd\"\n"), "true\nfalse\n");
    }

    #[test]
    fn is_keyword_compares() {
        assert_eq!(run("x = 3\nif x is 3 then\nprint \"yes\"\nend\n"), "yes\n");
    }

    #[test]
    fn for_loops_count_inclusive() {
        assert_eq!(run("for i = 1, 3 do\nprint i\nend\n"), "1\n2\n3\n");
    }

    #[test]
    fn string_concat_promotes_through_buffers() {
        let (_, vm) = run_with_host("s = \"a\"\ns = s + \"b\"\ns = s + 1\n", &mut TableHost::new());
        // the working value stays a buffer while it only lives in a global
        let s = vm.get_global("s");
        assert!(s.is_buffer());
        assert_eq!(vm.stringify(s), "ab1");
    }

    #[test]
    fn function_returns_flatten_buffers() {
        let src = "\
function join(a, b)
  return a + b
end
x = join(\"night\", \"script\")
";
        let (_, vm) = run_with_host(src, &mut TableHost::new());
        let x = vm.get_global("x");
        assert!(x.is_string(), "got {:?}", x);
        assert_eq!(vm.stringify(x), "nightscript");
    }

    #[test]
    fn host_call_arguments_flatten_buffers() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let mut host = TableHost::new();
        host.register_function(
            "observe",
            Box::new(move |args| {
                seen_in.borrow_mut().extend_from_slice(args);
                Value::nil()
            }),
        );
        let (_, vm) = run_with_host("s = \"a\" + \"b\"\nobserve(s)\n", &mut host);
        let args = seen.borrow();
        assert_eq!(args.len(), 1);
        assert!(args[0].is_string());
        assert_eq!(vm.stringify(args[0]), "ab");
    }

    #[test]
    fn host_functions_win_over_everything() {
        let mut host = TableHost::new();
        host.register_function("length", Box::new(|_| Value::integer(999)));
        let (out, _) = run_with_host("xs = { 1 }\nprint length of xs\n", &mut host);
        assert_eq!(out, "999\n");
    }

    #[test]
    fn host_lookup_is_case_insensitive() {
        let mut host = TableHost::new();
        host.register_function("Answer", Box::new(|_| Value::integer(42)));
        let (out, _) = run_with_host("print ANSWER()\n", &mut host);
        assert_eq!(out, "42\n");
    }

    #[test]
    fn sibling_functions_resolve_through_the_parent_chunk() {
        let src = "\
function outer()
  return helper()
end
function helper()
  return 7
end
print outer()
";
        assert_eq!(run(src), "7\n");
    }

    #[test]
    fn missing_arguments_default_to_nil() {
        let src = "\
function show(a, b)
  print a
  print b
end
show(1)
";
        assert_eq!(run(src), "1\nnil\n");
    }

    #[test]
    fn functions_without_return_produce_nil() {
        assert_eq!(run("function noop()\nend\nprint noop()\n"), "nil\n");
    }

    #[test]
    fn call_frames_balance_across_calls() {
        let src = "\
function inner(n)
  return n * 2
end
function outer(n)
  return inner(n) + inner(n)
end
print outer(10)
";
        let (out, vm) = run_with_host(src, &mut TableHost::new());
        assert_eq!(out, "40\n");
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        for src in ["x = 1\ny = 0\nprint x / y\n", "x = 1.5\ny = 0.0\nprint x / y\n"] {
            let mut vm = VM::with_output(Box::new(io::sink()));
            let chunk = compile(src, &mut vm.heap_mut().strings).unwrap();
            let result = vm.execute(&chunk, &mut TableHost::new());
            assert!(matches!(result, Err(Error::Runtime)), "{src}");
        }
    }

    #[test]
    fn modulo_by_zero_is_a_runtime_error() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let chunk = compile("x = 5\ny = 0\nprint x % y\n", &mut vm.heap_mut().strings).unwrap();
        assert!(vm.execute(&chunk, &mut TableHost::new()).is_err());
    }

    #[test]
    fn unknown_functions_are_runtime_errors() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let chunk = compile("nosuch(1)\n", &mut vm.heap_mut().strings).unwrap();
        assert!(vm.execute(&chunk, &mut TableHost::new()).is_err());
    }

    #[test]
    fn vm_is_reusable_after_a_runtime_error() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let mut host = TableHost::new();
        let bad = compile("x = 1 / y0\n", &mut vm.heap_mut().strings).unwrap();
        let _ = vm.execute(&bad, &mut host);
        let good = compile("x = 2\n", &mut vm.heap_mut().strings).unwrap();
        assert!(vm.execute(&good, &mut host).is_ok());
        assert_eq!(vm.get_global("x"), Value::integer(2));
    }

    #[test]
    fn array_index_out_of_range_is_an_error() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let chunk = compile("xs = { 1, 2 }\nprint xs[-3]\n", &mut vm.heap_mut().strings).unwrap();
        assert!(vm.execute(&chunk, &mut TableHost::new()).is_err());
    }

    #[test]
    fn integer_arithmetic_wraps_at_48_bits() {
        let src = "x = 140737488355327\ny = 1\nprint x + y\n";
        // 2^47 - 1 + 1 wraps to -2^47
        assert_eq!(run(src), "-140737488355328\n");
    }

    #[test]
    fn unary_minus_and_not() {
        assert_eq!(run("x = 5\nprint -x\nprint not nil\nprint not 0\n"), "-5\ntrue\nfalse\n");
    }

    #[test]
    fn opcode_counters_track_dispatch() {
        let (_, mut vm) = run_with_host("x = 1\ny = 2\n", &mut TableHost::new());
        assert_eq!(vm.op_count(OpCode::SetGlobal), 2);
        assert_eq!(vm.op_count(OpCode::Constant), 2);
        vm.reset_stats();
        assert_eq!(vm.op_count(OpCode::SetGlobal), 0);
    }

    #[test]
    fn set_global_updates_both_indices() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        vm.set_global("score", Value::integer(7));
        assert_eq!(vm.get_global("score"), Value::integer(7));
        let id = vm.heap().strings.find_id("score");
        assert_ne!(id, STRING_NOT_FOUND);
        assert_eq!(vm.globals_by_id.get(&id), Some(&Value::integer(7)));
        assert_eq!(vm.globals.get("score"), Some(&Value::integer(7)));
    }

    #[test]
    fn table_keyword_creates_an_empty_table() {
        let (_, vm) = run_with_host("t = table\n", &mut TableHost::new());
        assert!(vm.get_global("t").is_table());
    }

    #[test]
    fn table_keys_and_values_come_back_sorted() {
        let (_, vm) = run_with_host("t = { b: 2, a: 1, c: 3 }\n", &mut TableHost::new());
        let t = vm.get_global("t");
        assert!(t.is_table());
        let id = t.as_handle();
        let keys = vm.sorted_keys(id);
        let names: Vec<&str> = keys.iter().map(|&k| vm.heap.strings.get(k)).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let values: Vec<Value> = keys
            .iter()
            .map(|&k| vm.heap.tables.get(id, k).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![Value::integer(1), Value::integer(2), Value::integer(3)]
        );
    }

    #[test]
    fn nested_indexing_assigns_through() {
        let src = "\
grid = { { 1, 2 }, { 3, 4 } }
grid[1][0] = 9
print grid[1][0]
print grid[0][1]
";
        assert_eq!(run(src), "9\n2\n");
    }

    #[test]
    fn float_printing_drops_whole_number_decimals() {
        assert_eq!(run("print 3.0\nprint 2.5\nprint 10.0 / 4.0\n"), "3\n2.5\n2.5\n");
    }
}
