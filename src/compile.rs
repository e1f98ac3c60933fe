use rustc_hash::FxHashMap;

use crate::{
    token::{self, Token},
    tokenize, Chunk, CompileError, Function, OpCode, StringTable, Value, MAX_JUMP_OFFSET,
    MAX_LOCAL_VARIABLES,
};

/// Compile NightScript source into a chunk, interning every string literal
/// and identifier through `strings`.
///
/// The compiler is single-pass: it consumes tokens and writes bytecode
/// directly into the destination chunk, specializing opcodes from inferred
/// operand types, fusing local/constant load-add patterns, folding constant
/// arithmetic at emission time and threading jump chains once the chunk is
/// complete. On error it reports to stderr, skips to the next statement
/// boundary and keeps going, so several errors can be reported per compile;
/// `None` is returned if any error was seen.
pub fn compile(src: &str, strings: &mut StringTable) -> Option<Chunk> {
    let tokens = tokenize(src);
    let mut parser = Parser {
        tokens,
        current: 0,
        strings,
        ctxs: vec![FnCtx::default()],
        global_types: FxHashMap::default(),
        had_error: false,
        panic_mode: false,
    };

    while !parser.check(token::Type::Eof) {
        parser.statement();
        if parser.panic_mode {
            parser.synchronize();
        }
    }
    parser.emit_op(OpCode::Return);

    if parser.had_error {
        return None;
    }
    let mut chunk = parser
        .ctxs
        .pop()
        .expect("context stack is never empty")
        .chunk;
    thread_jumps(&mut chunk);
    Some(chunk)
}

/// What the compiler currently believes about a variable or expression.
/// Refreshed on every assignment and consulted when choosing between the
/// generic opcodes and their unchecked specializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inferred {
    Int,
    Float,
    Str,
    Bool,
    Nil,
    Unknown,
}

impl Inferred {
    fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

/// Binding strength of the binary operators, loosest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    /// Operator `or`
    Or,
    /// Operator `and`
    And,
    /// Operators `==` `!=` `<` `<=` `>` `>=`
    Comparison,
    /// Operators `+` `-`
    Term,
    /// Operators `*` `/` `%`
    Factor,
    /// Prefix `not` and `-`
    Unary,
}

impl Precedence {
    fn of(typ: token::Type) -> Self {
        match typ {
            token::Type::Or => Self::Or,
            token::Type::And => Self::And,
            token::Type::EqualEqual
            | token::Type::BangEqual
            | token::Type::Less
            | token::Type::LessEqual
            | token::Type::Greater
            | token::Type::GreaterEqual => Self::Comparison,
            token::Type::Plus | token::Type::Minus => Self::Term,
            token::Type::Star | token::Type::Slash | token::Type::Percent => Self::Factor,
            _ => Self::None,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::None => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor | Self::Unary => Self::Unary,
        }
    }
}

/// Per-function compilation state. The bottom entry is the top-level chunk;
/// a `function` declaration pushes a fresh context and pops it into the
/// parent's function list.
#[derive(Debug, Default)]
struct FnCtx {
    chunk: Chunk,
    /// Lowercased function name, empty at the top level.
    name: String,
    /// Frame locals: parameters first, then `local` declarations.
    locals: Vec<String>,
    local_types: Vec<Inferred>,
    /// Start offsets of the last two emitted instructions, for the
    /// emission-time peephole window.
    prev_start: Option<usize>,
    last_start: Option<usize>,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    current: usize,
    strings: &'a mut StringTable,
    ctxs: Vec<FnCtx>,
    global_types: FxHashMap<String, Inferred>,
    had_error: bool,
    panic_mode: bool,
}

fn starts_expression(typ: token::Type) -> bool {
    matches!(
        typ,
        token::Type::Number
            | token::Type::Str
            | token::Type::True
            | token::Type::False
            | token::Type::Nil
            | token::Type::LParen
            | token::Type::Ident
            | token::Type::Not
            | token::Type::Minus
            | token::Type::LBrace
            | token::Type::Table
    )
}

impl<'a> Parser<'a> {
    // ---- token plumbing -------------------------------------------------

    fn current_token(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn previous_token(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn peek_next_type(&self) -> token::Type {
        self.tokens
            .get(self.current + 1)
            .map(|t| t.typ)
            .unwrap_or(token::Type::Eof)
    }

    fn token_type_at(&self, at: usize) -> token::Type {
        self.tokens
            .get(at)
            .map(|t| t.typ)
            .unwrap_or(token::Type::Eof)
    }

    fn advance(&mut self) {
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
    }

    fn check(&self, typ: token::Type) -> bool {
        self.current_token().typ == typ
    }

    fn check_ident(&self, word: &str) -> bool {
        let t = self.current_token();
        t.typ == token::Type::Ident && t.lexeme == word
    }

    fn advance_when(&mut self, typ: token::Type) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, typ: token::Type, message: &str) {
        if self.check(typ) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn skip_newlines(&mut self) {
        while self.advance_when(token::Type::Newline) {}
    }

    fn synchronize(&mut self) {
        while !self.check(token::Type::Eof) && !self.check(token::Type::Newline) {
            self.advance();
        }
        self.advance_when(token::Type::Newline);
        self.panic_mode = false;
    }

    // ---- error reporting ------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let line = self.current_token().pos.line;
        let at = if self.check(token::Type::Eof) {
            None
        } else {
            Some(self.current_token().lexeme.clone())
        };
        self.report(line, at, message);
    }

    fn error_at_previous(&mut self, message: &str) {
        let t = self.previous_token();
        let (line, at) = (t.pos.line, Some(t.lexeme.clone()));
        self.report(line, at, message);
    }

    fn report(&mut self, line: usize, at: Option<String>, message: &str) {
        // suppress cascading errors until the next statement boundary
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        eprintln!(
            "{}",
            CompileError {
                line,
                at,
                message: message.to_string(),
            }
        );
    }

    // ---- emission -------------------------------------------------------

    fn ctx(&mut self) -> &mut FnCtx {
        self.ctxs.last_mut().expect("context stack is never empty")
    }

    fn ctx_ref(&self) -> &FnCtx {
        self.ctxs.last().expect("context stack is never empty")
    }

    fn line(&self) -> u32 {
        self.current_token().pos.line as u32
    }

    fn code_len(&self) -> usize {
        self.ctx_ref().chunk.code().len()
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        let ctx = self.ctx();
        let at = ctx.chunk.code().len();
        ctx.chunk.write_op(op, line);
        ctx.prev_start = ctx.last_start;
        ctx.last_start = Some(at);
    }

    fn emit_operand(&mut self, byte: u8) {
        let line = self.line();
        self.ctx().chunk.write_byte(byte, line);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.ctx().chunk.add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error_at_current("Too many constants in one chunk");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_operand(idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let at = self.code_len();
        self.emit_operand(0);
        at
    }

    fn patch_jump(&mut self, at: usize) {
        // offset counts from the byte after the operand to the target
        let offset = self.code_len() - (at + 1);
        if offset > MAX_JUMP_OFFSET {
            self.error_at_current("Jump too large");
        }
        self.ctx()
            .chunk
            .patch_byte(at, offset.min(MAX_JUMP_OFFSET) as u8);
    }

    fn emit_jump_back(&mut self, target: usize) {
        // the VM subtracts the offset after reading both bytes
        let offset = self.code_len() + 2 - target;
        if offset > MAX_JUMP_OFFSET {
            self.error_at_current("Loop body too large");
        }
        self.emit_op(OpCode::JumpBack);
        self.emit_operand(offset.min(MAX_JUMP_OFFSET) as u8);
    }

    // ---- the emission-time peephole window ------------------------------

    /// Start offsets of the last two instructions when they sit flush
    /// against the end of the code and are 2 bytes each.
    fn trailing_pair(&self) -> Option<(usize, usize)> {
        let ctx = self.ctx_ref();
        let len = ctx.chunk.code().len();
        match (ctx.prev_start, ctx.last_start) {
            (Some(p), Some(l)) if l + 2 == len && p + 2 == l => Some((p, l)),
            _ => None,
        }
    }

    fn forget_window(&mut self) {
        let ctx = self.ctx();
        ctx.prev_start = None;
        ctx.last_start = None;
    }

    /// Fold `CONSTANT a; CONSTANT b; <arith>` into a single constant.
    /// Division and modulo by a zero constant are left for the runtime to
    /// report.
    fn try_fold(&mut self, op: token::Type) -> Option<Inferred> {
        let (p, l) = self.trailing_pair()?;
        let chunk = &self.ctx_ref().chunk;
        let code = chunk.code();
        if code[p] != OpCode::Constant as u8 || code[l] != OpCode::Constant as u8 {
            return None;
        }
        let a = chunk.constant(code[p + 1])?;
        let b = chunk.constant(code[l + 1])?;

        let folded = if a.is_int() && b.is_int() {
            let (x, y) = (a.as_integer(), b.as_integer());
            let v = match op {
                token::Type::Plus => x.wrapping_add(y),
                token::Type::Minus => x.wrapping_sub(y),
                token::Type::Star => x.wrapping_mul(y),
                token::Type::Slash if y != 0 => x.wrapping_div(y),
                token::Type::Percent if y != 0 => x.wrapping_rem(y),
                _ => return None,
            };
            Value::integer(v)
        } else if (a.is_int() || a.is_float()) && (b.is_int() || b.is_float()) {
            let x = if a.is_float() {
                a.as_floating()
            } else {
                a.as_integer() as f64
            };
            let y = if b.is_float() {
                b.as_floating()
            } else {
                b.as_integer() as f64
            };
            let v = match op {
                token::Type::Plus => x + y,
                token::Type::Minus => x - y,
                token::Type::Star => x * y,
                token::Type::Slash if y != 0.0 => x / y,
                _ => return None,
            };
            Value::floating(v)
        } else {
            return None;
        };

        let typ = if folded.is_int() {
            Inferred::Int
        } else {
            Inferred::Float
        };
        self.ctx().chunk.truncate_code(p);
        self.forget_window();
        self.emit_constant(folded);
        Some(typ)
    }

    /// Fuse local/constant load pairs feeding a `+` into the combined
    /// opcodes. Only fires when the operand types are known; the fused
    /// forms skip runtime checks.
    fn try_fuse_add(&mut self, lhs: Inferred, rhs: Inferred) -> Option<Inferred> {
        let (p, l) = self.trailing_pair()?;
        let code = self.ctx_ref().chunk.code();
        let (first, second) = (code[p], code[l]);
        let (a, b) = (code[p + 1], code[l + 1]);
        let get_local = OpCode::GetLocal as u8;
        let constant = OpCode::Constant as u8;

        let both_int = lhs == Inferred::Int && rhs == Inferred::Int;
        let float_pair = lhs.is_numeric()
            && rhs.is_numeric()
            && (lhs == Inferred::Float || rhs == Inferred::Float);

        let (op, typ) = if first == get_local && second == get_local {
            if lhs == Inferred::Str || rhs == Inferred::Str {
                (OpCode::AddStringLocal, Inferred::Str)
            } else if both_int {
                (OpCode::AddLocal, Inferred::Int)
            } else if float_pair {
                (OpCode::AddFloatLocal, Inferred::Float)
            } else {
                return None;
            }
        } else if first == get_local && second == constant {
            if both_int {
                (OpCode::AddLocalConst, Inferred::Int)
            } else if float_pair {
                (OpCode::AddLocalConstFloat, Inferred::Float)
            } else {
                return None;
            }
        } else if first == constant && second == get_local {
            if both_int {
                (OpCode::AddConstLocal, Inferred::Int)
            } else if float_pair {
                (OpCode::AddConstLocalFloat, Inferred::Float)
            } else {
                return None;
            }
        } else {
            return None;
        };

        self.ctx().chunk.truncate_code(p);
        self.forget_window();
        self.emit_op(op);
        self.emit_operand(a);
        self.emit_operand(b);
        Some(typ)
    }

    /// Emit the opcode for a binary operator, picking a specialized form
    /// when the operand types are known.
    fn emit_binary(&mut self, op: token::Type, lhs: Inferred, rhs: Inferred) -> Inferred {
        let both_int = lhs == Inferred::Int && rhs == Inferred::Int;
        let float_pair = lhs.is_numeric()
            && rhs.is_numeric()
            && (lhs == Inferred::Float || rhs == Inferred::Float);

        match op {
            token::Type::Plus => {
                if let Some(typ) = self.try_fold(op) {
                    return typ;
                }
                if let Some(typ) = self.try_fuse_add(lhs, rhs) {
                    return typ;
                }
                if lhs == Inferred::Str || rhs == Inferred::Str {
                    self.emit_op(OpCode::AddString);
                    Inferred::Str
                } else if both_int {
                    self.emit_op(OpCode::AddInt);
                    Inferred::Int
                } else if float_pair {
                    self.emit_op(OpCode::AddFloat);
                    Inferred::Float
                } else {
                    self.emit_op(OpCode::Add);
                    Inferred::Unknown
                }
            }
            token::Type::Minus => {
                if let Some(typ) = self.try_fold(op) {
                    return typ;
                }
                if both_int {
                    self.emit_op(OpCode::SubInt);
                    Inferred::Int
                } else if float_pair {
                    self.emit_op(OpCode::SubFloat);
                    Inferred::Float
                } else {
                    self.emit_op(OpCode::Subtract);
                    Inferred::Unknown
                }
            }
            token::Type::Star => {
                if let Some(typ) = self.try_fold(op) {
                    return typ;
                }
                if both_int {
                    self.emit_op(OpCode::MulInt);
                    Inferred::Int
                } else if float_pair {
                    self.emit_op(OpCode::MulFloat);
                    Inferred::Float
                } else {
                    self.emit_op(OpCode::Multiply);
                    Inferred::Unknown
                }
            }
            token::Type::Slash => {
                if let Some(typ) = self.try_fold(op) {
                    return typ;
                }
                if both_int {
                    self.emit_op(OpCode::DivInt);
                    Inferred::Int
                } else if float_pair {
                    self.emit_op(OpCode::DivFloat);
                    Inferred::Float
                } else {
                    self.emit_op(OpCode::Divide);
                    Inferred::Unknown
                }
            }
            token::Type::Percent => {
                if let Some(typ) = self.try_fold(op) {
                    return typ;
                }
                if both_int {
                    self.emit_op(OpCode::ModInt);
                    Inferred::Int
                } else {
                    self.emit_op(OpCode::Modulo);
                    Inferred::Unknown
                }
            }
            token::Type::EqualEqual => {
                self.emit_op(OpCode::Equal);
                Inferred::Bool
            }
            token::Type::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
                Inferred::Bool
            }
            token::Type::Less => {
                self.emit_op(OpCode::Less);
                Inferred::Bool
            }
            token::Type::LessEqual => {
                self.emit_op(OpCode::LessEqual);
                Inferred::Bool
            }
            token::Type::Greater => {
                self.emit_op(OpCode::Greater);
                Inferred::Bool
            }
            token::Type::GreaterEqual => {
                self.emit_op(OpCode::GreaterEqual);
                Inferred::Bool
            }
            _ => unreachable!("Precedence table is wrong."),
        }
    }

    // ---- variables ------------------------------------------------------

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.ctx_ref()
            .locals
            .iter()
            .position(|local| local == name)
            .map(|slot| slot as u8)
    }

    fn emit_get_var(&mut self, name: &str) -> Inferred {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_op(OpCode::GetLocal);
            self.emit_operand(slot);
            self.ctx_ref().local_types[slot as usize]
        } else {
            let id = self.strings.intern(name);
            let idx = self.make_constant(Value::string(id));
            self.emit_op(OpCode::GetGlobal);
            self.emit_operand(idx);
            self.global_types
                .get(name)
                .copied()
                .unwrap_or(Inferred::Unknown)
        }
    }

    fn emit_set_var(&mut self, name: &str, typ: Inferred) {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_op(OpCode::SetLocal);
            self.emit_operand(slot);
            self.ctx().local_types[slot as usize] = typ;
        } else {
            let id = self.strings.intern(name);
            let idx = self.make_constant(Value::string(id));
            self.emit_op(OpCode::SetGlobal);
            self.emit_operand(idx);
            self.global_types.insert(name.to_owned(), typ);
        }
    }

    fn emit_call(&mut self, name: &str, argc: u8) {
        let id = self.strings.intern(name);
        let idx = self.make_constant(Value::string(id));
        self.emit_op(OpCode::CallHost);
        self.emit_operand(idx);
        self.emit_operand(argc);
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) -> Inferred {
        self.parse_precedence(Precedence::Or)
    }

    fn parse_precedence(&mut self, min: Precedence) -> Inferred {
        let mut lhs = self.primary();
        loop {
            let typ = self.current_token().typ;
            match typ {
                token::Type::And => {
                    if Precedence::And < min {
                        break;
                    }
                    self.advance();
                    lhs = self.and_rhs();
                }
                token::Type::Or => {
                    if Precedence::Or < min {
                        break;
                    }
                    self.advance();
                    lhs = self.or_rhs();
                }
                _ => {
                    let prec = Precedence::of(typ);
                    if prec == Precedence::None || prec < min {
                        break;
                    }
                    self.advance();
                    let rhs = self.parse_precedence(prec.next());
                    lhs = self.emit_binary(typ, lhs, rhs);
                }
            }
        }
        lhs
    }

    /// `a and b`: when `a` is falsey the result is `false` without
    /// evaluating `b`, otherwise the result is `b`.
    fn and_rhs(&mut self) -> Inferred {
        let skip_rhs = self.emit_jump(OpCode::JumpIfFalse);
        let _ = self.parse_precedence(Precedence::And.next());
        let over_false = self.emit_jump(OpCode::Jump);
        self.patch_jump(skip_rhs);
        self.emit_op(OpCode::False);
        self.patch_jump(over_false);
        Inferred::Unknown
    }

    /// `a or b`: when `a` is truthy the result is `true` without
    /// evaluating `b`, otherwise the result is `b`.
    fn or_rhs(&mut self) -> Inferred {
        let take_rhs = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::True);
        let over_rhs = self.emit_jump(OpCode::Jump);
        self.patch_jump(take_rhs);
        let _ = self.parse_precedence(Precedence::Or.next());
        self.patch_jump(over_rhs);
        Inferred::Unknown
    }

    fn primary(&mut self) -> Inferred {
        self.advance();
        let t = self.previous_token().clone();
        match t.typ {
            token::Type::Number => self.number(&t),
            token::Type::Str => {
                let id = self.strings.intern(&t.lexeme);
                self.emit_constant(Value::string(id));
                Inferred::Str
            }
            token::Type::True => {
                self.emit_op(OpCode::True);
                Inferred::Bool
            }
            token::Type::False => {
                self.emit_op(OpCode::False);
                Inferred::Bool
            }
            token::Type::Nil => {
                self.emit_op(OpCode::Nil);
                Inferred::Nil
            }
            token::Type::LParen => {
                let typ = self.expression();
                self.consume(token::Type::RParen, "Expected ')' after expression");
                self.postfix(typ)
            }
            token::Type::Not => {
                let _ = self.parse_precedence(Precedence::Comparison);
                self.emit_op(OpCode::Not);
                Inferred::Bool
            }
            token::Type::Minus => {
                // unary minus compiles as `0 - x`; a literal operand folds
                // into a single signed constant
                self.emit_constant(Value::integer(0));
                let rhs = self.parse_precedence(Precedence::Unary);
                self.emit_binary(token::Type::Minus, Inferred::Int, rhs)
            }
            token::Type::Ident => self.identifier(&t),
            token::Type::LBrace => self.brace_literal(),
            token::Type::Table => {
                self.emit_op(OpCode::TableCreate);
                Inferred::Unknown
            }
            _ => {
                self.error_at_previous("Expected expression");
                Inferred::Unknown
            }
        }
    }

    fn number(&mut self, t: &Token) -> Inferred {
        if t.lexeme.contains('.') {
            match t.lexeme.parse::<f64>() {
                Ok(v) => {
                    self.emit_constant(Value::floating(v));
                    Inferred::Float
                }
                Err(_) => {
                    self.error_at_previous("Invalid number");
                    Inferred::Unknown
                }
            }
        } else {
            match t.lexeme.parse::<i64>() {
                Ok(v) => {
                    self.emit_constant(Value::integer(v));
                    Inferred::Int
                }
                Err(_) => {
                    self.error_at_previous("Number literal too large");
                    Inferred::Unknown
                }
            }
        }
    }

    fn identifier(&mut self, t: &Token) -> Inferred {
        // `length of EXPR` sugar, always an integer
        if t.lexeme == "length" && self.check_ident("of") {
            self.advance();
            let _ = self.parse_precedence(Precedence::Unary);
            self.emit_call("length", 1);
            return Inferred::Int;
        }
        if self.check(token::Type::LParen) {
            let argc = self.parse_call_args();
            self.emit_call(&t.lexeme, argc);
            return self.postfix(Inferred::Unknown);
        }
        let typ = self.emit_get_var(&t.lexeme);
        self.postfix(typ)
    }

    /// Trailing `[index]` chains after a primary.
    fn postfix(&mut self, mut typ: Inferred) -> Inferred {
        while self.advance_when(token::Type::LBracket) {
            let _ = self.expression();
            self.consume(token::Type::RBracket, "Expected ']' after index");
            self.emit_op(OpCode::IndexGet);
            typ = Inferred::Unknown;
        }
        typ
    }

    fn parse_call_args(&mut self) -> u8 {
        self.consume(token::Type::LParen, "Expected '(' before arguments");
        let mut argc: usize = 0;
        self.skip_newlines();
        if !self.check(token::Type::RParen) {
            loop {
                self.expression();
                argc += 1;
                self.skip_newlines();
                if !self.advance_when(token::Type::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(token::Type::RParen, "Expected ')' after arguments");
        if argc > 255 {
            self.error_at_current("Too many arguments");
        }
        argc.min(255) as u8
    }

    /// `{ ... }` is an array literal unless the first element is a key
    /// followed by `:`.
    fn brace_literal(&mut self) -> Inferred {
        self.skip_newlines();
        if self.advance_when(token::Type::RBrace) {
            self.emit_op(OpCode::ArrayCreate);
            self.emit_operand(0);
            return Inferred::Unknown;
        }

        let key_like = matches!(
            self.current_token().typ,
            token::Type::Ident | token::Type::Str
        );
        if key_like && self.peek_next_type() == token::Type::Colon {
            self.emit_op(OpCode::TableCreate);
            loop {
                self.skip_newlines();
                let key = self.current_token().lexeme.clone();
                if !self.advance_when(token::Type::Ident) && !self.advance_when(token::Type::Str) {
                    self.error_at_current("Expected table key");
                    break;
                }
                let id = self.strings.intern(&key);
                self.emit_constant(Value::string(id));
                self.consume(token::Type::Colon, "Expected ':' after table key");
                self.expression();
                self.emit_op(OpCode::TableSet);
                self.skip_newlines();
                if !self.advance_when(token::Type::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(token::Type::RBrace) {
                    break;
                }
            }
            self.consume(token::Type::RBrace, "Expected '}' after table entries");
            return Inferred::Unknown;
        }

        let mut count: usize = 0;
        loop {
            self.expression();
            count += 1;
            self.skip_newlines();
            if !self.advance_when(token::Type::Comma) {
                break;
            }
            self.skip_newlines();
            if self.check(token::Type::RBrace) {
                break;
            }
        }
        self.consume(token::Type::RBrace, "Expected '}' after array elements");
        if count > 255 {
            self.error_at_current("Too many elements in array literal");
        }
        self.emit_op(OpCode::ArrayCreate);
        self.emit_operand(count.min(255) as u8);
        Inferred::Unknown
    }

    // ---- statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.advance_when(token::Type::Newline) {
            return;
        }
        match self.current_token().typ {
            token::Type::If => self.if_statement(),
            token::Type::While => self.while_statement(),
            token::Type::For => self.for_statement(),
            token::Type::Function => self.function_declaration(),
            token::Type::Return => self.return_statement(),
            token::Type::Local => self.local_declaration(),
            token::Type::Ident => self.identifier_statement(),
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Pop);
    }

    /// Disambiguate the statements that start with an identifier:
    /// assignment, indexed assignment, bare calls, the `print`/container
    /// sugar forms, or a plain expression. One token of lookahead decides.
    fn identifier_statement(&mut self) {
        let name = self.current_token().lexeme.clone();
        let next = self.peek_next_type();

        match name.as_str() {
            "print" if starts_expression(next) => {
                self.advance();
                self.print_statement();
                return;
            }
            "add" if starts_expression(next) && next != token::Type::LParen => {
                self.advance();
                self.add_sugar();
                return;
            }
            "remove" if next == token::Type::Ident => {
                self.advance();
                self.remove_sugar();
                return;
            }
            "clear" if next == token::Type::Ident => {
                self.advance();
                self.clear_sugar();
                return;
            }
            _ => {}
        }

        match next {
            token::Type::Assign => {
                self.advance();
                self.advance();
                let typ = self.expression();
                self.emit_set_var(&name, typ);
                self.emit_op(OpCode::Pop);
            }
            token::Type::LBracket if self.is_indexed_assignment() => {
                self.indexed_assignment(&name);
            }
            token::Type::Newline | token::Type::Eof => {
                // a bare identifier is a zero-argument call
                self.advance();
                self.emit_call(&name, 0);
                self.emit_op(OpCode::Pop);
            }
            token::Type::LParen => self.expression_statement(),
            typ if starts_expression(typ) => {
                // bare call with space-separated arguments
                self.advance();
                let mut argc: usize = 0;
                while starts_expression(self.current_token().typ) {
                    self.expression();
                    argc += 1;
                }
                if argc > 255 {
                    self.error_at_current("Too many arguments");
                }
                self.emit_call(&name, argc.min(255) as u8);
                self.emit_op(OpCode::Pop);
            }
            _ => self.expression_statement(),
        }
    }

    /// True when the tokens ahead spell `name[...]...[...] = `.
    fn is_indexed_assignment(&self) -> bool {
        let mut at = self.current + 1;
        loop {
            if self.token_type_at(at) != token::Type::LBracket {
                return false;
            }
            let mut depth = 0usize;
            loop {
                match self.token_type_at(at) {
                    token::Type::LBracket => depth += 1,
                    token::Type::RBracket => {
                        depth -= 1;
                        if depth == 0 {
                            at += 1;
                            break;
                        }
                    }
                    token::Type::Newline | token::Type::Eof => return false,
                    _ => {}
                }
                at += 1;
            }
            match self.token_type_at(at) {
                token::Type::LBracket => continue,
                token::Type::Assign => return true,
                _ => return false,
            }
        }
    }

    fn count_index_groups(&self) -> usize {
        let mut at = self.current + 1;
        let mut groups = 0;
        while self.token_type_at(at) == token::Type::LBracket {
            let mut depth = 0usize;
            loop {
                match self.token_type_at(at) {
                    token::Type::LBracket => depth += 1,
                    token::Type::RBracket => {
                        depth -= 1;
                        if depth == 0 {
                            at += 1;
                            break;
                        }
                    }
                    token::Type::Newline | token::Type::Eof => return groups,
                    _ => {}
                }
                at += 1;
            }
            groups += 1;
        }
        groups
    }

    fn indexed_assignment(&mut self, name: &str) {
        let groups = self.count_index_groups();
        self.advance(); // the identifier
        self.emit_get_var(name);
        for group in 0..groups {
            self.consume(token::Type::LBracket, "Expected '[' in assignment target");
            self.expression();
            self.consume(token::Type::RBracket, "Expected ']' after index");
            if group + 1 < groups {
                self.emit_op(OpCode::IndexGet);
            }
        }
        self.consume(token::Type::Assign, "Expected '=' after assignment target");
        self.expression();
        self.emit_op(OpCode::IndexSet);
    }

    /// `print expr [expr ...]`: every expression but the last is followed
    /// by a space, the last one by a newline.
    fn print_statement(&mut self) {
        loop {
            self.expression();
            if starts_expression(self.current_token().typ) {
                self.emit_op(OpCode::PrintSpace);
            } else {
                self.emit_op(OpCode::Print);
                break;
            }
        }
    }

    /// `add VALUE to LIST` desugars to `add(VALUE, LIST)`.
    fn add_sugar(&mut self) {
        self.expression();
        if self.check_ident("to") {
            self.advance();
        } else {
            self.error_at_current("Expected 'to' after value");
        }
        self.expression();
        self.emit_call("add", 2);
        self.emit_op(OpCode::Pop);
    }

    /// `remove LIST[INDEX]` desugars to `remove(LIST, INDEX)`.
    fn remove_sugar(&mut self) {
        let name = self.current_token().lexeme.clone();
        self.consume(token::Type::Ident, "Expected a list name after 'remove'");
        self.emit_get_var(&name);
        self.consume(token::Type::LBracket, "Expected '[' after list name");
        self.expression();
        self.consume(token::Type::RBracket, "Expected ']' after index");
        self.emit_call("remove", 2);
        self.emit_op(OpCode::Pop);
    }

    /// `clear LIST` desugars to `clear(LIST)`.
    fn clear_sugar(&mut self) {
        let name = self.current_token().lexeme.clone();
        self.consume(token::Type::Ident, "Expected a list name after 'clear'");
        self.emit_get_var(&name);
        self.emit_call("clear", 1);
        self.emit_op(OpCode::Pop);
    }

    fn block(&mut self, terminators: &[token::Type]) {
        while !terminators.iter().any(|&t| self.check(t)) && !self.check(token::Type::Eof) {
            self.statement();
            if self.panic_mode {
                self.synchronize();
            }
        }
    }

    fn if_statement(&mut self) {
        self.advance(); // 'if'
        let mut end_jumps = Vec::new();
        loop {
            self.expression();
            self.consume(token::Type::Then, "Expected 'then' after condition");
            let skip_branch = self.emit_jump(OpCode::JumpIfFalse);
            self.block(&[token::Type::Else, token::Type::Elseif, token::Type::End]);
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(skip_branch);
            if self.advance_when(token::Type::Elseif) {
                continue;
            }
            if self.advance_when(token::Type::Else) {
                self.block(&[token::Type::End]);
            }
            break;
        }
        self.consume(token::Type::End, "Expected 'end' to close an if statement");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        self.advance(); // 'while'
        let loop_start = self.code_len();
        self.expression();
        self.consume(token::Type::Do, "Expected 'do' after loop condition");
        let exit = self.emit_jump(OpCode::JumpIfFalse);
        self.block(&[token::Type::End]);
        self.consume(token::Type::End, "Expected 'end' to close a while loop");
        self.emit_jump_back(loop_start);
        self.patch_jump(exit);
    }

    /// `for name = start, limit do ... end` desugars to initialization, a
    /// `name <= limit` test, the body, `name = name + 1` and a backward
    /// jump.
    fn for_statement(&mut self) {
        self.advance(); // 'for'
        let name = self.current_token().lexeme.clone();
        self.consume(token::Type::Ident, "Expected loop variable after 'for'");
        self.consume(token::Type::Assign, "Expected '=' after loop variable");
        let start_typ = self.expression();
        self.emit_set_var(&name, start_typ);
        self.emit_op(OpCode::Pop);
        self.consume(token::Type::Comma, "Expected ',' after loop start");

        let loop_start = self.code_len();
        let var_typ = self.emit_get_var(&name);
        let limit_typ = self.expression();
        self.emit_binary(token::Type::LessEqual, var_typ, limit_typ);
        self.consume(token::Type::Do, "Expected 'do' after loop bounds");
        let exit = self.emit_jump(OpCode::JumpIfFalse);

        self.block(&[token::Type::End]);
        self.consume(token::Type::End, "Expected 'end' to close a for loop");

        let var_typ = self.emit_get_var(&name);
        self.emit_constant(Value::integer(1));
        let sum_typ = self.emit_binary(token::Type::Plus, var_typ, Inferred::Int);
        self.emit_set_var(&name, sum_typ);
        self.emit_op(OpCode::Pop);
        self.emit_jump_back(loop_start);
        self.patch_jump(exit);
    }

    fn function_declaration(&mut self) {
        self.advance(); // 'function'
        let name = self.current_token().lexeme.clone();
        self.consume(token::Type::Ident, "Expected function name");
        let lower = name.to_lowercase();

        let mut params = Vec::new();
        if self.advance_when(token::Type::LParen) {
            if !self.check(token::Type::RParen) {
                loop {
                    let param = self.current_token().lexeme.clone();
                    self.consume(token::Type::Ident, "Expected parameter name");
                    params.push(param);
                    if !self.advance_when(token::Type::Comma) {
                        break;
                    }
                }
            }
            self.consume(token::Type::RParen, "Expected ')' after parameters");
        }
        if params.len() > MAX_LOCAL_VARIABLES {
            self.error_at_current("Too many parameters");
        }

        self.ctxs.push(FnCtx {
            chunk: Chunk::default(),
            name: lower.clone(),
            local_types: vec![Inferred::Unknown; params.len()],
            locals: params.clone(),
            prev_start: None,
            last_start: None,
        });
        self.block(&[token::Type::End]);
        self.consume(token::Type::End, "Expected 'end' to close function");
        self.emit_op(OpCode::Return);

        let ctx = self.ctxs.pop().expect("context stack is never empty");
        let function = Function {
            name: lower,
            params,
            locals: ctx.locals,
            chunk: ctx.chunk,
        };
        self.ctx().chunk.add_function(function);
    }

    fn return_statement(&mut self) {
        self.advance(); // 'return'
        if matches!(
            self.current_token().typ,
            token::Type::Newline
                | token::Type::Eof
                | token::Type::End
                | token::Type::Else
                | token::Type::Elseif
        ) {
            self.emit_op(OpCode::Nil);
            self.emit_op(OpCode::Return);
            return;
        }

        if self.is_self_tail_call() {
            let name = self.current_token().lexeme.clone();
            self.advance(); // the function's own name
            let argc = self.parse_call_args();
            let id = self.strings.intern(&name);
            let idx = self.make_constant(Value::string(id));
            self.emit_op(OpCode::TailCall);
            self.emit_operand(idx);
            self.emit_operand(argc);
            return;
        }

        self.expression();
        self.emit_op(OpCode::Return);
    }

    /// A `return f(...)` where `f` names the function being compiled and
    /// the call is the whole returned expression.
    fn is_self_tail_call(&self) -> bool {
        let ctx = self.ctx_ref();
        if ctx.name.is_empty() {
            return false;
        }
        let t = self.current_token();
        if t.typ != token::Type::Ident || !t.lexeme.eq_ignore_ascii_case(&ctx.name) {
            return false;
        }
        if self.peek_next_type() != token::Type::LParen {
            return false;
        }
        let mut at = self.current + 1;
        let mut depth = 0usize;
        loop {
            match self.token_type_at(at) {
                token::Type::LParen => depth += 1,
                token::Type::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        at += 1;
                        break;
                    }
                }
                token::Type::Newline | token::Type::Eof => return false,
                _ => {}
            }
            at += 1;
        }
        matches!(
            self.token_type_at(at),
            token::Type::Newline
                | token::Type::Eof
                | token::Type::End
                | token::Type::Else
                | token::Type::Elseif
        )
    }

    /// `local name [, name ...]` reserves frame slots; no code is emitted.
    fn local_declaration(&mut self) {
        self.advance(); // 'local'
        if self.ctxs.len() == 1 {
            self.error_at_current("Can't declare locals at the top level");
        }
        loop {
            let name = self.current_token().lexeme.clone();
            self.consume(token::Type::Ident, "Expected variable name after 'local'");
            if self.ctx_ref().locals.len() >= MAX_LOCAL_VARIABLES {
                self.error_at_current("Too many local variables in function");
            } else {
                let ctx = self.ctx();
                ctx.locals.push(name);
                ctx.local_types.push(Inferred::Unknown);
            }
            if !self.advance_when(token::Type::Comma) {
                break;
            }
        }
    }
}

/// Retarget every forward jump that lands on an unconditional `JUMP` to
/// that jump's own destination, following chains up to 64 hops. A
/// retargeted offset that would not fit in one byte leaves the original
/// jump untouched so behavior never changes.
pub(crate) fn thread_jumps(chunk: &mut Chunk) {
    let len = chunk.code().len();
    let mut ip = 0;
    while ip < len {
        let op = match OpCode::from_byte(chunk.code()[ip]) {
            Some(op) => op,
            None => break,
        };
        if matches!(op, OpCode::Jump | OpCode::JumpIfFalse) {
            let mut target = ip + 2 + chunk.code()[ip + 1] as usize;
            let mut hops = 0;
            while hops < 64 && target + 1 < len && chunk.code()[target] == OpCode::Jump as u8 {
                target = target + 2 + chunk.code()[target + 1] as usize;
                hops += 1;
            }
            let offset = target - (ip + 2);
            if offset <= MAX_JUMP_OFFSET {
                chunk.patch_byte(ip + 1, offset as u8);
            }
        }
        ip += 1 + op.operand_width();
    }
    for function in chunk.functions_mut() {
        thread_jumps(&mut function.chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(src: &str) -> Chunk {
        let mut strings = StringTable::default();
        compile(src, &mut strings).expect("source should compile")
    }

    fn ops_of(chunk: &Chunk) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let code = chunk.code();
        let mut ip = 0;
        while ip < code.len() {
            let op = OpCode::from_byte(code[ip]).expect("valid opcode stream");
            ops.push(op);
            ip += 1 + op.operand_width();
        }
        ops
    }

    #[test]
    fn constant_arithmetic_folds_at_emission() {
        let chunk = compiled("x = 2 + 3 * 4\n");
        assert!(chunk.constants().contains(&Value::integer(14)));
        let ops = ops_of(&chunk);
        assert!(!ops.contains(&OpCode::Add));
        assert!(!ops.contains(&OpCode::AddInt));
        assert!(!ops.contains(&OpCode::MulInt));
        assert_eq!(
            ops,
            vec![
                OpCode::Constant,
                OpCode::SetGlobal,
                OpCode::Pop,
                OpCode::Return
            ]
        );
    }

    #[test]
    fn mixed_constant_folding_promotes_to_float() {
        let chunk = compiled("x = 1 + 2.5\n");
        assert!(chunk.constants().contains(&Value::floating(3.5)));
    }

    #[test]
    fn folding_skips_zero_divisors() {
        let chunk = compiled("x = 1 / 0\n");
        let ops = ops_of(&chunk);
        assert!(ops.contains(&OpCode::DivInt));
        let chunk = compiled("x = 1 % 0\n");
        assert!(ops_of(&chunk).contains(&OpCode::ModInt));
    }

    #[test]
    fn unary_minus_on_a_literal_folds_to_a_signed_constant() {
        let chunk = compiled("x = -5\n");
        assert!(chunk.constants().contains(&Value::integer(-5)));
        assert_eq!(
            ops_of(&chunk),
            vec![
                OpCode::Constant,
                OpCode::SetGlobal,
                OpCode::Pop,
                OpCode::Return
            ]
        );
    }

    #[test]
    fn typed_globals_pick_specialized_opcodes() {
        let chunk = compiled("x = 1\ny = 2\nz = x + y\n");
        assert!(ops_of(&chunk).contains(&OpCode::AddInt));
        let chunk = compiled("x = 1.5\ny = 2.5\nz = x + y\n");
        assert!(ops_of(&chunk).contains(&OpCode::AddFloat));
        let chunk = compiled("x = \"a\"\ny = \"b\"\nz = x + y\n");
        assert!(ops_of(&chunk).contains(&OpCode::AddString));
    }

    #[test]
    fn unknown_operand_types_stay_generic() {
        let chunk = compiled("z = a + b\n");
        assert!(ops_of(&chunk).contains(&OpCode::Add));
    }

    #[test]
    fn local_pairs_fuse_into_add_local() {
        let src = "function f()\nlocal x, y\nx = 1\ny = 2\nreturn x + y\nend\n";
        let chunk = compiled(src);
        let body = &chunk.functions()[0].chunk;
        let ops = ops_of(body);
        assert!(ops.contains(&OpCode::AddLocal), "got {:?}", ops);
    }

    #[test]
    fn local_and_constant_fuse_both_ways() {
        let src = "function f()\nlocal x\nx = 1\nx = x + 1\nx = 1 + x\nend\n";
        let chunk = compiled(src);
        let ops = ops_of(&chunk.functions()[0].chunk);
        assert!(ops.contains(&OpCode::AddLocalConst), "got {:?}", ops);
        assert!(ops.contains(&OpCode::AddConstLocal), "got {:?}", ops);
    }

    #[test]
    fn float_locals_fuse_into_the_float_variants() {
        let src = "function f()\nlocal x, y\nx = 1.5\ny = 2.5\nreturn x + y\nend\n";
        let chunk = compiled(src);
        assert!(ops_of(&chunk.functions()[0].chunk).contains(&OpCode::AddFloatLocal));
    }

    #[test]
    fn string_locals_fuse_into_add_string_local() {
        let src = "function f(a)\nlocal x, y\nx = \"a\"\ny = \"b\"\nreturn x + y\nend\n";
        let chunk = compiled(src);
        assert!(ops_of(&chunk.functions()[0].chunk).contains(&OpCode::AddStringLocal));
    }

    #[test]
    fn parameters_resolve_to_local_slots() {
        let chunk = compiled("function f(a, b)\nreturn a + b\nend\n");
        let body = &chunk.functions()[0].chunk;
        let ops = ops_of(body);
        assert!(ops.contains(&OpCode::GetLocal));
        assert!(!ops.contains(&OpCode::GetGlobal));
        // parameter types are unknown, so the add stays generic
        assert!(ops.contains(&OpCode::Add));
    }

    #[test]
    fn functions_are_registered_under_their_lowercased_name() {
        let chunk = compiled("function Greet(who)\nprint who\nend\n");
        assert_eq!(chunk.function_index("greet"), Some(0));
        let f = &chunk.functions()[0];
        assert_eq!(f.params, vec!["who".to_string()]);
        assert_eq!(f.locals, vec!["who".to_string()]);
    }

    #[test]
    fn locals_extend_the_frame_after_parameters() {
        let chunk = compiled("function f(a)\nlocal b, c\nb = 1\nend\n");
        let f = &chunk.functions()[0];
        assert_eq!(f.locals, vec!["a", "b", "c"]);
    }

    #[test]
    fn self_recursive_tail_calls_compile_to_tail_call() {
        let src = "function count(n)\nif n == 0 then return \"done\" end\nreturn count(n - 1)\nend\n";
        let chunk = compiled(src);
        let ops = ops_of(&chunk.functions()[0].chunk);
        assert!(ops.contains(&OpCode::TailCall), "got {:?}", ops);
    }

    #[test]
    fn non_tail_position_recursion_stays_a_plain_call() {
        let src = "function fib(n)\nif n < 2 then return n end\nreturn fib(n - 1) + fib(n - 2)\nend\n";
        let chunk = compiled(src);
        let ops = ops_of(&chunk.functions()[0].chunk);
        assert!(!ops.contains(&OpCode::TailCall));
        assert!(ops.contains(&OpCode::CallHost));
    }

    #[test]
    fn jump_offset_of_255_compiles_and_256_does_not() {
        // then-branch bytes: 81 prints at 3 bytes, 2 stores at 5 bytes,
        // plus the 2-byte jump over the else branch = 255 exactly
        let mut fits = String::from("if x then\n");
        for _ in 0..81 {
            fits.push_str("print 1\n");
        }
        for _ in 0..2 {
            fits.push_str("y = 1\n");
        }
        fits.push_str("end\n");
        let mut strings = StringTable::default();
        assert!(compile(&fits, &mut strings).is_some());

        // 83 prints and 1 store push the offset to 256
        let mut overflows = String::from("if x then\n");
        for _ in 0..83 {
            overflows.push_str("print 1\n");
        }
        overflows.push_str("y = 1\n");
        overflows.push_str("end\n");
        let mut strings = StringTable::default();
        assert!(compile(&overflows, &mut strings).is_none());
    }

    #[test]
    fn oversized_loop_bodies_are_rejected() {
        let mut src = String::from("while x do\n");
        for _ in 0..100 {
            src.push_str("print 1\n");
        }
        src.push_str("end\n");
        let mut strings = StringTable::default();
        assert!(compile(&src, &mut strings).is_none());
    }

    #[test]
    fn jump_threading_collapses_chains() {
        let mut chunk = Chunk::default();
        // 0: JUMP -> 2; 2: JUMP -> 4; 4: RETURN
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Return, 1);
        thread_jumps(&mut chunk);
        // the first jump now lands directly on RETURN
        assert_eq!(chunk.code()[1], 2);
    }

    #[test]
    fn jump_threading_is_bounded_on_cycles() {
        let mut chunk = Chunk::default();
        // a jump chain that loops back on itself must not hang the walker:
        // 0: JUMP -> 2; 2: JUMP -> 2 (self loop via offset 254 is not
        // constructible forward, so emulate a long chain instead)
        for _ in 0..70 {
            chunk.write_op(OpCode::Jump, 1);
            chunk.write_byte(0, 1);
        }
        chunk.write_op(OpCode::Return, 1);
        thread_jumps(&mut chunk);
        // bounded at 64 hops; the walker terminates and the first jump
        // was retargeted somewhere further down the chain
        assert!(chunk.code()[1] > 0);
    }

    #[test]
    fn nested_statements_compile() {
        let src = "\
x = 10
if x > 5 then
  print \"big\"
elseif x > 2 then
  print \"mid\"
else
  print \"small\"
end
while x > 0 do
  x = x - 1
end
for i = 1, 3 do
  print i
end
";
        let chunk = compiled(src);
        let ops = ops_of(&chunk);
        assert!(ops.contains(&OpCode::JumpIfFalse));
        assert!(ops.contains(&OpCode::JumpBack));
    }

    #[test]
    fn logical_operators_short_circuit_with_jumps() {
        let chunk = compiled("x = a and b\ny = a or b\n");
        let ops = ops_of(&chunk);
        assert!(ops.contains(&OpCode::JumpIfFalse));
        assert!(ops.contains(&OpCode::Jump));
    }

    #[test]
    fn container_sugar_desugars_to_host_calls() {
        let chunk = compiled("add 5 to xs\nremove xs[0]\nclear xs\nx = length of xs\n");
        let ops = ops_of(&chunk);
        let calls = ops.iter().filter(|&&op| op == OpCode::CallHost).count();
        assert_eq!(calls, 4);
    }

    #[test]
    fn literals_choose_between_arrays_and_tables() {
        let chunk = compiled("xs = { 1, 2, 3 }\nt = { name: \"elm\", age: 3 }\n");
        let ops = ops_of(&chunk);
        assert!(ops.contains(&OpCode::ArrayCreate));
        assert!(ops.contains(&OpCode::TableCreate));
        assert!(ops.contains(&OpCode::TableSet));
    }

    #[test]
    fn indexed_assignment_emits_index_set() {
        let chunk = compiled("xs[0] = 5\n");
        let ops = ops_of(&chunk);
        assert!(ops.contains(&OpCode::IndexSet));
        let chunk = compiled("grid[1][2] = 5\n");
        let ops = ops_of(&chunk);
        assert!(ops.contains(&OpCode::IndexGet));
        assert!(ops.contains(&OpCode::IndexSet));
    }

    #[test]
    fn statements_are_stack_neutral() {
        // every statement form pops or consumes what it pushes; spot-check
        // by counting stack effects over a straight-line chunk
        let chunk = compiled("x = 1\nprint x\nx\nf(1, 2)\n");
        let code = chunk.code();
        let mut depth: i64 = 0;
        let mut ip = 0;
        while ip < code.len() {
            let op = OpCode::from_byte(code[ip]).unwrap();
            depth += match op {
                OpCode::Constant | OpCode::GetGlobal | OpCode::GetLocal => 1,
                OpCode::SetGlobal | OpCode::SetLocal => 0,
                OpCode::Pop | OpCode::Print | OpCode::PrintSpace => -1,
                OpCode::CallHost => 1 - i64::from(code[ip + 2]),
                OpCode::Return => 0,
                _ => 0,
            };
            ip += 1 + op.operand_width();
        }
        assert_eq!(depth, 0);
    }

    #[test]
    fn errors_are_reported_per_statement_and_compilation_continues() {
        let mut strings = StringTable::default();
        // two broken statements, one good one; compile fails but does not
        // stop at the first error
        let out = compile("x = @\ny = )\nz = 1\n", &mut strings);
        assert!(out.is_none());
    }

    #[test]
    fn locals_at_top_level_are_rejected() {
        let mut strings = StringTable::default();
        assert!(compile("local x\n", &mut strings).is_none());
    }
}
