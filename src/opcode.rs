/// OpCode is the single byte that starts every instruction. Inline operands
/// (constant index, local slot, jump offset, argument count) are also single
/// bytes, which caps chunks at 256 constants, functions at 256 locals and
/// jumps at a distance of 255.
///
/// Stack effects below are written `[before] -> [after]` with the top of the
/// stack on the right.
///
/// The specialized arithmetic forms (`AddInt`, `AddFloat`, ...) skip the
/// runtime type checks of their generic counterparts. The compiler only
/// emits them when both operand types are known; when its inference is
/// wrong the payload bits are reinterpreted and the script silently
/// misbehaves, which is the documented price of the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Load a constant: operand is the pool index. `[] -> [v]`
    Constant = 0,
    /// Push `nil`
    Nil,
    /// Push `true`
    True,
    /// Push `false`
    False,
    /// Read a global: operand indexes the name constant. `[] -> [v]`
    GetGlobal,
    /// Write a global; the value stays on the stack. `[v] -> [v]`
    SetGlobal,
    /// Read the local in frame slot `operand`. `[] -> [v]`
    GetLocal,
    /// Write the local in frame slot `operand`; the value stays. `[v] -> [v]`
    SetLocal,
    /// Type-dispatched addition or string concatenation. `[a b] -> [a+b]`
    Add,
    /// Type-dispatched subtraction. `[a b] -> [a-b]`
    Subtract,
    /// Type-dispatched multiplication. `[a b] -> [a*b]`
    Multiply,
    /// Type-dispatched division. `[a b] -> [a/b]`
    Divide,
    /// Integer remainder. `[a b] -> [a%b]`
    Modulo,
    /// Unchecked integer addition. `[a b] -> [a+b]`
    AddInt,
    /// Unchecked float addition. `[a b] -> [a+b]`
    AddFloat,
    /// String concatenation through the buffer promotion rule. `[a b] -> [buf]`
    AddString,
    /// Unchecked integer subtraction. `[a b] -> [a-b]`
    SubInt,
    /// Unchecked float subtraction. `[a b] -> [a-b]`
    SubFloat,
    /// Unchecked integer multiplication. `[a b] -> [a*b]`
    MulInt,
    /// Unchecked float multiplication. `[a b] -> [a*b]`
    MulFloat,
    /// Integer division, zero divisor is a runtime error. `[a b] -> [a/b]`
    DivInt,
    /// Float division, zero divisor is a runtime error. `[a b] -> [a/b]`
    DivFloat,
    /// Integer remainder, zero divisor is a runtime error. `[a b] -> [a%b]`
    ModInt,
    /// Variant-wise equality. `[a b] -> [bool]`
    Equal,
    /// Numeric greater-than; mixed kinds yield `false`. `[a b] -> [bool]`
    Greater,
    /// Numeric greater-or-equal; mixed kinds yield `false`. `[a b] -> [bool]`
    GreaterEqual,
    /// Numeric less-or-equal; mixed kinds yield `false`. `[a b] -> [bool]`
    LessEqual,
    /// Numeric less-than; mixed kinds yield `false`. `[a b] -> [bool]`
    Less,
    /// Logical negation by falsiness. `[v] -> [bool]`
    Not,
    /// Unconditional forward jump by `operand` bytes.
    Jump,
    /// Pop the condition; jump forward by `operand` bytes when it is falsey.
    /// `[cond] -> []`
    JumpIfFalse,
    /// Unconditional backward jump by `operand` bytes.
    JumpBack,
    /// Call by name: operands are the name-constant index and the argument
    /// count. Resolution order: host environment, current chunk functions,
    /// parent chunk functions, built-in container intrinsics.
    /// `[a1 .. an] -> [ret]`
    CallHost,
    /// Self tail call: operands as `CallHost`. Arguments overwrite the
    /// current locals and the instruction pointer resets to the start of
    /// the same chunk. `[a1 .. an] -> []`
    TailCall,
    /// Terminate the run of the current chunk; the return value, if any,
    /// is on top of the stack.
    Return,
    /// Discard the top of the stack. `[v] -> []`
    Pop,
    /// Write the top of the stack followed by a newline. `[v] -> []`
    Print,
    /// Write the top of the stack followed by a space. `[v] -> []`
    PrintSpace,
    /// Fused `GET_LOCAL a; GET_LOCAL b; ADD_INT`: operands are two slots.
    /// `[] -> [a+b]`
    AddLocal,
    /// Fused float addition of two locals: operands are two slots.
    /// `[] -> [a+b]`
    AddFloatLocal,
    /// Fused concatenation of two locals: operands are two slots.
    /// `[] -> [buf]`
    AddStringLocal,
    /// Fused integer local + constant: operands are a slot and a pool index.
    /// `[] -> [a+k]`
    AddLocalConst,
    /// Fused integer constant + local: operands are a pool index and a slot.
    /// `[] -> [k+a]`
    AddConstLocal,
    /// Float flavor of [`OpCode::AddLocalConst`].
    AddLocalConstFloat,
    /// Float flavor of [`OpCode::AddConstLocal`].
    AddConstLocalFloat,
    /// Consume `operand` values and push a new array holding them.
    /// `[e1 .. en] -> [arr]`
    ArrayCreate,
    /// Read an array element by signed index. `[arr i] -> [v]`
    ArrayGet,
    /// Write an array element by signed index. `[arr i v] -> []`
    ArraySet,
    /// Push an array's element count. `[arr] -> [n]`
    ArrayLength,
    /// Append to an array. `[arr v] -> []`
    ArrayPush,
    /// Remove and push an array's last element, `nil` when empty.
    /// `[arr] -> [v]`
    ArrayPop,
    /// Push a new empty table. `[] -> [tbl]`
    TableCreate,
    /// Look a key up, pushing `nil` when absent. `[tbl k] -> [v]`
    TableGet,
    /// Insert a key, keeping the table on the stack (used while building
    /// literals). `[tbl k v] -> [tbl]`
    TableSet,
    /// Key-presence test. `[tbl k] -> [bool]`
    TableHas,
    /// Push an array of the table's keys, sorted by contents.
    /// `[tbl] -> [arr]`
    TableKeys,
    /// Push an array of the table's values, in key order. `[tbl] -> [arr]`
    TableValues,
    /// Push a table's entry count. `[tbl] -> [n]`
    TableSize,
    /// Remove a key. `[tbl k] -> []`
    TableRemove,
    /// Container-dispatched read: arrays take integer indices, tables take
    /// string keys. `[c i] -> [v]`
    IndexGet,
    /// Container-dispatched write. `[c i v] -> []`
    IndexSet,
}

impl OpCode {
    /// Decode a byte, `None` when it is no opcode.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte <= Self::IndexSet as u8 {
            // Sound: the enum is repr(u8) with contiguous discriminants
            // from 0 through IndexSet.
            Some(unsafe { std::mem::transmute::<u8, Self>(byte) })
        } else {
            None
        }
    }

    /// Number of inline operand bytes following the opcode byte.
    pub fn operand_width(self) -> usize {
        match self {
            Self::Constant
            | Self::GetGlobal
            | Self::SetGlobal
            | Self::GetLocal
            | Self::SetLocal
            | Self::Jump
            | Self::JumpIfFalse
            | Self::JumpBack
            | Self::ArrayCreate => 1,
            Self::CallHost
            | Self::TailCall
            | Self::AddLocal
            | Self::AddFloatLocal
            | Self::AddStringLocal
            | Self::AddLocalConst
            | Self::AddConstLocal
            | Self::AddLocalConstFloat
            | Self::AddConstLocalFloat => 2,
            _ => 0,
        }
    }

    /// Disassembly name.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Constant => "OP_CONSTANT",
            Self::Nil => "OP_NIL",
            Self::True => "OP_TRUE",
            Self::False => "OP_FALSE",
            Self::GetGlobal => "OP_GET_GLOBAL",
            Self::SetGlobal => "OP_SET_GLOBAL",
            Self::GetLocal => "OP_GET_LOCAL",
            Self::SetLocal => "OP_SET_LOCAL",
            Self::Add => "OP_ADD",
            Self::Subtract => "OP_SUBTRACT",
            Self::Multiply => "OP_MULTIPLY",
            Self::Divide => "OP_DIVIDE",
            Self::Modulo => "OP_MODULO",
            Self::AddInt => "OP_ADD_INT",
            Self::AddFloat => "OP_ADD_FLOAT",
            Self::AddString => "OP_ADD_STRING",
            Self::SubInt => "OP_SUB_INT",
            Self::SubFloat => "OP_SUB_FLOAT",
            Self::MulInt => "OP_MUL_INT",
            Self::MulFloat => "OP_MUL_FLOAT",
            Self::DivInt => "OP_DIV_INT",
            Self::DivFloat => "OP_DIV_FLOAT",
            Self::ModInt => "OP_MOD_INT",
            Self::Equal => "OP_EQUAL",
            Self::Greater => "OP_GREATER",
            Self::GreaterEqual => "OP_GREATER_EQUAL",
            Self::LessEqual => "OP_LESS_EQUAL",
            Self::Less => "OP_LESS",
            Self::Not => "OP_NOT",
            Self::Jump => "OP_JUMP",
            Self::JumpIfFalse => "OP_JUMP_IF_FALSE",
            Self::JumpBack => "OP_JUMP_BACK",
            Self::CallHost => "OP_CALL_HOST",
            Self::TailCall => "OP_TAIL_CALL",
            Self::Return => "OP_RETURN",
            Self::Pop => "OP_POP",
            Self::Print => "OP_PRINT",
            Self::PrintSpace => "OP_PRINT_SPACE",
            Self::AddLocal => "OP_ADD_LOCAL",
            Self::AddFloatLocal => "OP_ADD_FLOAT_LOCAL",
            Self::AddStringLocal => "OP_ADD_STRING_LOCAL",
            Self::AddLocalConst => "OP_ADD_LOCAL_CONST",
            Self::AddConstLocal => "OP_ADD_CONST_LOCAL",
            Self::AddLocalConstFloat => "OP_ADD_LOCAL_CONST_FLOAT",
            Self::AddConstLocalFloat => "OP_ADD_CONST_LOCAL_FLOAT",
            Self::ArrayCreate => "OP_ARRAY_CREATE",
            Self::ArrayGet => "OP_ARRAY_GET",
            Self::ArraySet => "OP_ARRAY_SET",
            Self::ArrayLength => "OP_ARRAY_LENGTH",
            Self::ArrayPush => "OP_ARRAY_PUSH",
            Self::ArrayPop => "OP_ARRAY_POP",
            Self::TableCreate => "OP_TABLE_CREATE",
            Self::TableGet => "OP_TABLE_GET",
            Self::TableSet => "OP_TABLE_SET",
            Self::TableHas => "OP_TABLE_HAS",
            Self::TableKeys => "OP_TABLE_KEYS",
            Self::TableValues => "OP_TABLE_VALUES",
            Self::TableSize => "OP_TABLE_SIZE",
            Self::TableRemove => "OP_TABLE_REMOVE",
            Self::IndexGet => "OP_INDEX_GET",
            Self::IndexSet => "OP_INDEX_SET",
        }
    }
}
