use std::sync::Arc;

use super::chunk::{Chunk, OpCode};
use super::heap::Heap;
use super::object::{FnObj, ObjBody, ObjRef};
use super::scanner::{Scanner, Token, TokenKind};
use super::value::Value;

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------
//
// Single-pass Pratt parser emitting bytecode as it goes. A stack of
// `FnCompiler`s mirrors the nesting of function declarations; lexical scope
// and upvalue resolution walk that stack. Errors print immediately in the
// `[line N] Error ...` format and flip `had_error`; panic mode swallows
// cascades until the next statement boundary.

/// Marker result: messages have already been written to stderr.
#[derive(Debug)]
pub struct CompileError;

/// Compile a source string into the implicit top-level script function.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    if parser.had_error {
        Err(CompileError)
    } else {
        Ok(function)
    }
}

// -- Precedence --

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . ()
    Subscript,  // []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Subscript,
            Precedence::Subscript => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Parser<'_, '_>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (
            Some(|p, c| p.grouping(c)),
            Some(|p, c| p.call(c)),
            Precedence::Call,
        ),
        LeftBracket => (
            Some(|p, c| p.list_literal(c)),
            Some(|p, c| p.subscript(c)),
            Precedence::Subscript,
        ),
        Dot => (None, Some(|p, c| p.dot(c)), Precedence::Call),
        Minus => (
            Some(|p, c| p.unary(c)),
            Some(|p, c| p.binary(c)),
            Precedence::Term,
        ),
        Plus => (None, Some(|p, c| p.binary(c)), Precedence::Term),
        Slash | Star | Percent => (None, Some(|p, c| p.binary(c)), Precedence::Factor),
        Bang => (Some(|p, c| p.unary(c)), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(|p, c| p.binary(c)), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(|p, c| p.binary(c)), Precedence::Comparison)
        }
        Identifier => (Some(|p, c| p.variable(c)), None, Precedence::None),
        String => (Some(|p, c| p.string(c)), None, Precedence::None),
        Number => (Some(|p, c| p.number(c)), None, Precedence::None),
        And => (None, Some(|p, c| p.and_(c)), Precedence::And),
        Or => (None, Some(|p, c| p.or_(c)), Precedence::Or),
        True | False | Nil => (Some(|p, c| p.literal(c)), None, Precedence::None),
        This => (Some(|p, c| p.this_(c)), None, Precedence::None),
        Super => (Some(|p, c| p.super_(c)), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

// -- Per-function compilation state --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

struct Local<'src> {
    name: &'src str,
    /// -1 between declaration and initializer completion.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueMeta {
    index: u8,
    is_local: bool,
}

struct FnCompiler<'src> {
    kind: FunctionKind,
    name: std::string::String,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueMeta>,
    scope_depth: i32,
    /// Lexical nesting of `finish` blocks within this function.
    finish_depth: u32,
}

impl<'src> FnCompiler<'src> {
    fn new(kind: FunctionKind, name: std::string::String) -> FnCompiler<'src> {
        // Slot 0 belongs to the receiver in methods and to an anonymous
        // sentinel everywhere else.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            captured: false,
        };
        FnCompiler {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            finish_depth: 0,
        }
    }
}

struct ClassCompiler {
    has_superclass: bool,
}

// -- Parser --

struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<FnCompiler<'src>>,
    class_compilers: Vec<ClassCompiler>,
    heap: &'h mut Heap,
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Parser<'src, 'h> {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Parser {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            compilers: vec![FnCompiler::new(FunctionKind::Script, std::string::String::new())],
            class_compilers: Vec::new(),
            heap,
        }
    }

    // -- Token plumbing --

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // -- Errors --

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        match token.kind {
            TokenKind::Eof => eprintln!("[line {}] Error at end: {}", token.line, message),
            TokenKind::Error => eprintln!("[line {}] Error: {}", token.line, message),
            _ => eprintln!(
                "[line {}] Error at '{}': {}",
                token.line, token.lexeme, message
            ),
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Finish
                | TokenKind::Async => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- Emission --

    fn current_compiler(&self) -> &FnCompiler<'src> {
        &self.compilers[self.compilers.len() - 1]
    }

    fn current_compiler_mut(&mut self) -> &mut FnCompiler<'src> {
        let last = self.compilers.len() - 1;
        &mut self.compilers[last]
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_compiler_mut().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.as_byte());
    }

    fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_return(&mut self) {
        if self.current_compiler().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if self.current_compiler().chunk.constants.len() >= 255 {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.current_chunk().add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(constant);
    }

    /// Emit a jump with a two-byte placeholder; returns the operand offset.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_compiler().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // Distance is measured from the byte after the operand.
        let jump = self.current_compiler().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let code = &mut self.current_compiler_mut().chunk.code;
        code[offset] = bytes[0];
        code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_compiler().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueMeta>) {
        self.emit_return();
        let fc = match self.compilers.pop() {
            Some(fc) => fc,
            None => unreachable!("compiler stack underflow"),
        };
        let name = if fc.name.is_empty() {
            None
        } else {
            Some(self.heap.intern(&fc.name))
        };
        let function = self.heap.alloc(ObjBody::Function(FnObj {
            arity: fc.arity,
            upvalue_count: fc.upvalues.len(),
            chunk: Arc::new(fc.chunk),
            name,
        }));
        (function, fc.upvalues)
    }

    // -- Scope handling --

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        loop {
            let trailing = {
                let fc = self.current_compiler();
                fc.locals
                    .last()
                    .filter(|local| local.depth > fc.scope_depth)
                    .map(|local| local.captured)
            };
            match trailing {
                Some(true) => self.emit_op(OpCode::CloseUpvalue),
                Some(false) => self.emit_op(OpCode::Pop),
                None => break,
            }
            self.current_compiler_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_compiler().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_compiler_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let fc = self.current_compiler();
        let mut duplicate = false;
        for local in fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < fc.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let fc = self.current_compiler_mut();
        if fc.scope_depth == 0 {
            return;
        }
        if let Some(local) = fc.locals.last_mut() {
            local.depth = fc.scope_depth;
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.heap.intern(name);
        self.make_constant(Value::Obj(string))
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, ci: usize, name: &str) -> Option<u8> {
        let len = self.compilers[ci].locals.len();
        for i in (0..len).rev() {
            if self.compilers[ci].locals[i].name == name {
                if self.compilers[ci].locals[i].depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, ci: usize, index: u8, is_local: bool) -> u8 {
        if let Some(i) = self.compilers[ci]
            .upvalues
            .iter()
            .position(|uv| uv.index == index && uv.is_local == is_local)
        {
            return i as u8;
        }
        if self.compilers[ci].upvalues.len() >= 255 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[ci].upvalues.push(UpvalueMeta { index, is_local });
        (self.compilers[ci].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, ci: usize, name: &str) -> Option<u8> {
        if ci == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(ci - 1, name) {
            self.compilers[ci - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(ci, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(ci - 1, name) {
            return Some(self.add_upvalue(ci, upvalue, false));
        }
        None
    }

    // -- Expressions --

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match rule(self.previous.kind).prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let string = self.heap.intern(contents);
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(rule(op).precedence.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulus),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let ci = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(ci, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(ci, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_byte(arg);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 items in a list literal.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list items.");
        self.emit_op(OpCode::BuildList);
        self.emit_byte(count as u8);
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::IndexSet);
        } else {
            self.emit_op(OpCode::IndexGet);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.class_compilers.last().map(|cc| cc.has_superclass) {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable(synthetic_token("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(synthetic_token("super"), false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(synthetic_token("super"), false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    // -- Declarations and statements --

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(cc) = self.class_compilers.last_mut() {
                cc.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .class_compilers
            .last()
            .map(|cc| cc.has_superclass)
            .unwrap_or(false);
        if has_superclass {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_token = self.previous;
        let constant = self.identifier_constant(name_token.lexeme);
        let kind = if name_token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, name_token.lexeme.to_string());
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.lexeme.to_string();
        self.mark_initialized();
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: std::string::String) {
        self.compilers.push(FnCompiler::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.current_compiler().arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_compiler_mut().arity = arity + 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Finish) {
            self.finish_statement();
        } else if self.match_token(TokenKind::Async) {
            self.async_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if matches!(
            self.current.kind,
            TokenKind::Future | TokenKind::Await | TokenKind::Lambda | TokenKind::Reduce
        ) {
            let message = format!("'{}' is reserved.", self.current.lexeme);
            self.error_at_current(&message);
            self.advance();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.current_compiler().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_compiler().chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_compiler().chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_compiler().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn finish_statement(&mut self) {
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'finish'.");
        self.emit_op(OpCode::FinishBegin);
        self.current_compiler_mut().finish_depth += 1;
        self.begin_scope();
        self.block();
        self.end_scope();
        self.current_compiler_mut().finish_depth -= 1;
        self.emit_op(OpCode::FinishEnd);
    }

    fn async_statement(&mut self) {
        if self.current_compiler().finish_depth == 0 {
            self.error("'async' outside of 'finish' block.");
        }
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'async'.");
        // The parent jumps straight over the body; a forked child starts
        // executing right after the jump operand.
        let over_body = self.emit_jump(OpCode::AsyncBegin);
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_op(OpCode::AsyncEnd);
        self.patch_jump(over_body);
    }
}

fn synthetic_token(text: &'static str) -> Token<'static> {
    Token {
        kind: TokenKind::Identifier,
        lexeme: text,
        line: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::chunk::OpCode;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("expected compile success");
        (heap, function)
    }

    fn compile_fails(source: &str) {
        let mut heap = Heap::new();
        assert!(
            compile(source, &mut heap).is_err(),
            "expected compile error for: {source}"
        );
    }

    fn ops_of(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        // Decode the instruction stream, skipping operand bytes.
        let chunk = heap.function(function).chunk.clone();
        let mut ops = Vec::new();
        let mut i = 0;
        while i < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[i]).expect("valid opcode");
            ops.push(op);
            i += 1 + match op {
                OpCode::Constant
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::DefineGlobal
                | OpCode::SetGlobal
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::GetProperty
                | OpCode::SetProperty
                | OpCode::GetSuper
                | OpCode::Call
                | OpCode::Class
                | OpCode::Method
                | OpCode::BuildList => 1,
                OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::Loop
                | OpCode::AsyncBegin
                | OpCode::Invoke
                | OpCode::SuperInvoke => 2,
                OpCode::Closure => {
                    let constant = chunk.code[i + 1];
                    let upvalues = match chunk.constants[constant as usize] {
                        Value::Obj(r) => heap.function(r).upvalue_count,
                        _ => 0,
                    };
                    1 + 2 * upvalues
                }
                _ => 0,
            };
        }
        ops
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let (heap, function) = compile_ok("print 1 + 2 * 3;");
        let ops = ops_of(&heap, function);
        assert_eq!(
            ops,
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn compilation_is_deterministic() {
        let source = "fun f(a) { return a * 2; } print f(21);";
        let mut heap1 = Heap::new();
        let f1 = compile(source, &mut heap1).expect("ok");
        let mut heap2 = Heap::new();
        let f2 = compile(source, &mut heap2).expect("ok");
        assert_eq!(
            heap1.function(f1).chunk.code,
            heap2.function(f2).chunk.code
        );
    }

    #[test]
    fn modulus_and_subscript_compile() {
        let (heap, function) = compile_ok("var xs = [1, 2]; print xs[10 % 2];");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::BuildList));
        assert!(ops.contains(&OpCode::Modulus));
        assert!(ops.contains(&OpCode::IndexGet));
    }

    #[test]
    fn subscript_assignment_emits_index_set() {
        let (heap, function) = compile_ok("var xs = [1]; xs[0] = 2;");
        assert!(ops_of(&heap, function).contains(&OpCode::IndexSet));
    }

    #[test]
    fn method_call_compiles_to_invoke() {
        let (heap, function) = compile_ok("var o = nil; o.tick(1, 2);");
        assert!(ops_of(&heap, function).contains(&OpCode::Invoke));
    }

    #[test]
    fn finish_async_block_shape() {
        let (heap, function) = compile_ok("finish { async { print 1; } }");
        let ops = ops_of(&heap, function);
        assert_eq!(
            ops,
            vec![
                OpCode::FinishBegin,
                OpCode::AsyncBegin,
                OpCode::Constant,
                OpCode::Print,
                OpCode::AsyncEnd,
                OpCode::FinishEnd,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn async_jump_skips_over_body() {
        let (heap, function) = compile_ok("finish { async { print 1; } }");
        let chunk = &heap.function(function).chunk;
        // FinishBegin, then AsyncBegin at offset 1 with a 2-byte operand.
        assert_eq!(chunk.code[1], OpCode::AsyncBegin.as_byte());
        let offset = u16::from_be_bytes([chunk.code[2], chunk.code[3]]) as usize;
        // Landing pad is the byte just after AsyncEnd.
        assert_eq!(
            chunk.code[4 + offset - 1],
            OpCode::AsyncEnd.as_byte()
        );
    }

    #[test]
    fn upvalue_capture_in_nested_function() {
        let (heap, script) = compile_ok(
            "fun outer() { var n = 0; fun inner() { n = n + 1; return n; } return inner; }",
        );
        let find_fn = |heap: &Heap, owner: ObjRef| {
            heap.function(owner)
                .chunk
                .constants
                .iter()
                .find_map(|v| match v {
                    Value::Obj(r)
                        if matches!(
                            heap.get(*r).body,
                            crate::vm::object::ObjBody::Function(_)
                        ) =>
                    {
                        Some(*r)
                    }
                    _ => None,
                })
                .expect("function constant")
        };
        let outer = find_fn(&heap, script);
        let inner = find_fn(&heap, outer);
        assert_eq!(heap.function(inner).upvalue_count, 1);
    }

    // -- Compile errors --

    #[test]
    fn invalid_assignment_target() {
        compile_fails("1 + 2 = 3;");
    }

    #[test]
    fn read_local_in_own_initializer() {
        compile_fails("{ var a = 1; { var a = a; } }");
    }

    #[test]
    fn duplicate_local_in_scope() {
        compile_fails("{ var a = 1; var a = 2; }");
    }

    #[test]
    fn return_at_top_level() {
        compile_fails("return 1;");
    }

    #[test]
    fn this_outside_class() {
        compile_fails("print this;");
    }

    #[test]
    fn super_outside_class() {
        compile_fails("print super.x;");
    }

    #[test]
    fn super_without_superclass() {
        compile_fails("class A { m() { super.m(); } }");
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        compile_fails("class A < A {}");
    }

    #[test]
    fn initializer_cannot_return_value() {
        compile_fails("class A { init() { return 1; } }");
    }

    #[test]
    fn async_outside_finish() {
        compile_fails("async { print 1; }");
    }

    #[test]
    fn async_in_function_inside_finish_is_not_lexically_enclosed() {
        compile_fails("finish { fun f() { async { print 1; } } }");
    }

    #[test]
    fn reserved_words_are_rejected() {
        compile_fails("future;");
        compile_fails("await;");
        compile_fails("lambda;");
        compile_fails("reduce;");
    }

    #[test]
    fn constant_pool_overflows_at_256() {
        let mut source = std::string::String::new();
        for i in 0..128 {
            source.push_str(&format!("var v{i} = {i}.5;"));
        }
        // 128 names + 128 numbers = 256 constants.
        compile_fails(&source);
    }

    #[test]
    fn constant_pool_accepts_255() {
        let mut source = std::string::String::new();
        for i in 0..127 {
            source.push_str(&format!("var v{i} = {i}.5;"));
        }
        source.push_str("var last = nil;");
        // 127 names + 127 numbers + 1 name = 255 constants.
        let mut heap = Heap::new();
        assert!(compile(&source, &mut heap).is_ok());
    }

    #[test]
    fn unterminated_string_is_a_compile_error() {
        compile_fails("print \"oops;");
    }

    // -- Operand-width boundaries --

    #[test]
    fn jump_distance_overflow() {
        // `a = a;` compiles to five bytes and zero constants, so the then
        // branch can exceed the u16 jump range without other limits
        // firing first.
        let mut source = std::string::String::from("{ var a; if (true) { ");
        source.push_str(&"a = a; ".repeat(14_000));
        source.push_str("} }");
        compile_fails(&source);
    }

    #[test]
    fn local_count_boundary() {
        let mut ok = std::string::String::from("{ ");
        for i in 0..255 {
            ok.push_str(&format!("var l{i}; "));
        }
        ok.push('}');
        let mut heap = Heap::new();
        assert!(compile(&ok, &mut heap).is_ok());

        let mut overflow = std::string::String::from("{ ");
        for i in 0..256 {
            overflow.push_str(&format!("var l{i}; "));
        }
        overflow.push('}');
        compile_fails(&overflow);
    }

    #[test]
    fn argument_count_boundary() {
        // Locals carry no constant-pool entries, so only the argument
        // limit is in play.
        let params: Vec<std::string::String> = (0..255).map(|i| format!("p{i}")).collect();
        let header = format!("fun f({}) {{}}\n", params.join(", "));

        let mut ok = header.clone();
        ok.push_str("{ var a = 1; f(");
        ok.push_str(&vec!["a"; 255].join(", "));
        ok.push_str("); }");
        let mut heap = Heap::new();
        assert!(compile(&ok, &mut heap).is_ok());

        let mut overflow = header;
        overflow.push_str("{ var a = 1; f(");
        overflow.push_str(&vec!["a"; 256].join(", "));
        overflow.push_str("); }");
        compile_fails(&overflow);
    }

    #[test]
    fn upvalue_count_boundary() {
        // 300 locals across two enclosing functions; the innermost
        // function referencing all of them needs 300 upvalues.
        let mut source = std::string::String::from("fun outer() { ");
        for i in 0..200 {
            source.push_str(&format!("var a{i}; "));
        }
        source.push_str("fun middle() { ");
        for i in 0..100 {
            source.push_str(&format!("var b{i}; "));
        }
        source.push_str("fun inner() { ");
        for i in 0..200 {
            source.push_str(&format!("a{i}; "));
        }
        for i in 0..100 {
            source.push_str(&format!("b{i}; "));
        }
        source.push_str("} } }");
        compile_fails(&source);
    }
}
