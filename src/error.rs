use std::fmt;

/// Top-level failure of a compile-and-execute round.
#[derive(Debug)]
pub enum Error {
    /// One or more compilation errors happened; messages were printed.
    Compile,
    /// A runtime error happened; the message was printed and the stack reset.
    Runtime,
}

impl std::error::Error for Error {}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => write!(f, "Compilation error(s) occured."),
            Self::Runtime => write!(f, "Runtime error(s) occured."),
        }
    }
}

/// Virtual machine errors. Each one aborts the current `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Push on a full value stack or too many nested calls.
    StackOverflow,
    /// Pop from an empty value stack.
    StackUnderflow,
    /// Integer or float division with a zero divisor.
    DivisionByZero,
    /// Integer modulo with a zero divisor.
    ModuloByZero,
    /// `CALL_HOST` name resolved in neither the host environment nor the
    /// user functions.
    UnknownFunction(String),
    /// Byte that does not decode to any opcode (corrupted bytecode).
    UnknownOpcode(u8),
    /// Bytecode ended in the middle of an instruction (corrupted bytecode).
    TruncatedBytecode,
    /// Constant-pool index with no matching constant (corrupted bytecode).
    BadConstant(u8),
    /// Local slot outside the current frame (indicates a compiler bug).
    LocalSlotOutOfRange(u8),
    /// Call-frame stack size changed unexpectedly across a call.
    FrameImbalance,
    /// Operand(s) given to an opcode have the wrong type.
    InvalidOperands(&'static str),
    /// Array access outside the valid signed index range.
    BadIndex(i64),
    /// Execution was interrupted from outside the VM.
    Interrupted,
}

impl std::error::Error for RuntimeError {}
impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "Stack overflow"),
            Self::StackUnderflow => write!(f, "Stack underflow"),
            Self::DivisionByZero => write!(f, "Division by zero"),
            Self::ModuloByZero => write!(f, "Modulo by zero"),
            Self::UnknownFunction(name) => write!(f, "Unknown function: {}", name),
            Self::UnknownOpcode(byte) => write!(f, "Unknown opcode: {}", byte),
            Self::TruncatedBytecode => write!(f, "Truncated bytecode"),
            Self::BadConstant(idx) => write!(f, "No constant at index {}", idx),
            Self::LocalSlotOutOfRange(slot) => write!(f, "Local slot {} out of range", slot),
            Self::FrameImbalance => write!(f, "Call frame stack out of balance"),
            Self::InvalidOperands(msg) => write!(f, "{}", msg),
            Self::BadIndex(idx) => write!(f, "Index {} out of range", idx),
            Self::Interrupted => write!(f, "Execution interrupted"),
        }
    }
}

/// An error reported while compiling, tied to the token where it happened.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Source line of the offending token.
    pub line: usize,
    /// Lexeme of the offending token, `None` at end of input.
    pub at: Option<String>,
    /// What went wrong.
    pub message: String,
}

impl std::error::Error for CompileError {}
impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.at {
            Some(lexeme) => write!(
                f,
                "[line {}] Error at '{}': {}",
                self.line, lexeme, self.message
            ),
            None => write!(f, "[line {}] Error at end: {}", self.line, self.message),
        }
    }
}
