use super::chunk::OpCode;
use super::heap::{Heap, ObjRef};
use super::reporter::{Phase, Report, Reporter};
use super::scanner::Scanner;
use super::token::{Token, TokenType};
use super::value::{Function, Obj, Value};

/// Locals live in one fixed-size window per function; slot 0 is reserved
/// for the callee (or `this` inside methods).
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'a> = fn(&mut Compiler<'src, 'a>, bool);

struct ParseRule<'src, 'a> {
    prefix: Option<ParseFn<'src, 'a>>,
    infix: Option<ParseFn<'src, 'a>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. These nest like the functions they
/// compile; resolution walks the stack outward.
struct FnCtx<'src> {
    kind: FunctionKind,
    function: Function,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FnCtx<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => Token::synthetic("this"),
            _ => Token::synthetic(""),
        };
        Self {
            kind,
            function: Function::new(name),
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

/// Single-pass compiler: tokens go in, bytecode comes out of the chunk of
/// whichever function is on top of the context stack. There is no AST; the
/// Pratt rule table drives expression parsing directly.
pub struct Compiler<'src, 'a> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'a mut Heap,
    reporter: &'a mut dyn Reporter,
    ctxs: Vec<FnCtx<'src>>,
    classes: Vec<ClassCtx>,
}

impl<'src, 'a> Compiler<'src, 'a> {
    pub fn new(source: &'src str, heap: &'a mut Heap, reporter: &'a mut dyn Reporter) -> Self {
        let placeholder = Token::new(TokenType::Eof, "", 0);
        Self {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            heap,
            reporter,
            ctxs: vec![FnCtx::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    /// Compiles the whole source, surfacing as many errors as possible, and
    /// returns the top-level function only when none occurred.
    pub fn compile(mut self) -> Result<ObjRef, ()> {
        self.advance();
        while !self.matches(TokenType::Eof) {
            self.declaration();
        }
        let (function, _) = self.pop_ctx();
        if self.had_error {
            Err(())
        } else {
            Ok(self.heap.alloc(Obj::Function(function)))
        }
    }

    // -- token plumbing --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at(self.current, message);
        }
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.current.typ == typ {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.typ {
            TokenType::Eof => " at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.reporter.error(Report::new(
            Phase::Compile,
            format!("[line {}] Error{}: {}", token.line, location, message),
        ));
    }

    /// Skips forward to a statement boundary so one mistake produces one
    /// diagnostic.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- emission --------------------------------------------------------

    fn ctx(&self) -> &FnCtx<'src> {
        self.ctxs.last().unwrap()
    }

    fn ctx_mut(&mut self) -> &mut FnCtx<'src> {
        self.ctxs.last_mut().unwrap()
    }

    fn chunk_len(&self) -> usize {
        self.ctx().function.chunk.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.ctx_mut().function.chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.ctx_mut().function.chunk.write_op(op, line);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_return(&mut self) {
        if self.ctx().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.ctx_mut().function.chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 skips the operand itself; the VM bumps `ip` past it before
        // applying the jump.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.ctx_mut()
            .function
            .chunk
            .patch_short(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.previous.line;
        self.ctx_mut()
            .function
            .chunk
            .write_short(offset as u16, line);
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u8 {
        let interned = self.heap.intern(name.lexeme);
        self.make_constant(Value::Obj(interned))
    }

    // -- function contexts -----------------------------------------------

    fn push_ctx(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        self.ctxs.push(FnCtx::new(kind, name));
    }

    fn pop_ctx(&mut self) -> (Function, Vec<UpvalueDesc>) {
        self.emit_return();
        let ctx = self.ctxs.pop().unwrap();
        let mut function = ctx.function;
        function.upvalue_count = ctx.upvalues.len();

        #[cfg(feature = "debug-bytecode")]
        {
            if !self.had_error {
                let name = match function.name {
                    Some(name) => self.heap.str_chars(name).to_string(),
                    None => "<script>".to_string(),
                };
                print!("{}", function.chunk.disassemble(self.heap, &name));
            }
        }

        (function, ctx.upvalues)
    }

    // -- scopes and variables --------------------------------------------

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;
        loop {
            let ctx = self.ctx();
            match ctx.locals.last() {
                Some(local) if local.depth > ctx.scope_depth => {
                    let captured = local.is_captured;
                    self.ctx_mut().locals.pop();
                    if captured {
                        self.emit_op(OpCode::CloseUpvalue);
                    } else {
                        self.emit_op(OpCode::Pop);
                    }
                }
                _ => break,
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.ctx().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        for local in self.ctx().locals.iter().rev() {
            if local.depth != -1 && local.depth < self.ctx().scope_depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.ctx().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn mark_initialized(&mut self) {
        let ctx = self.ctx_mut();
        if ctx.scope_depth == 0 {
            return;
        }
        let depth = ctx.scope_depth;
        ctx.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, ctx_idx: usize, name: Token<'src>) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (index, local) in self.ctxs[ctx_idx].locals.iter().enumerate().rev() {
            if local.name.lexeme == name.lexeme {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(index as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Finds `name` in an enclosing function, capturing it as we return
    /// through each nesting level so the whole chain can reach it.
    fn resolve_upvalue(&mut self, ctx_idx: usize, name: Token<'src>) -> Option<u8> {
        if ctx_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(ctx_idx - 1, name) {
            self.ctxs[ctx_idx - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ctx_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(ctx_idx - 1, name) {
            return Some(self.add_upvalue(ctx_idx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, ctx_idx: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        let upvalues = &mut self.ctxs[ctx_idx].upvalues;
        if let Some(existing) = upvalues.iter().position(|&u| u == desc) {
            return existing as u8;
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(desc);
        (upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let ctx_idx = self.ctxs.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(ctx_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(ctx_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_byte(arg);
    }

    // -- declarations and statements -------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenType::Class) {
            self.class_declaration();
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCtx {
            has_superclass: false,
        });

        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // A scoped synthetic local lets methods close over `super`.
            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may recurse into its own name, so it is usable before
        // its body finishes compiling.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.push_ctx(kind, Some(name));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.ctx().function.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.ctx_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.pop_ctx();
        let function = self.heap.alloc(Obj::Function(function));
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
        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        // The initializer's variable lives in its own scope that spans the
        // whole loop, so closures made in the body all share it.
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenType::Semicolon) {
            // No initializer.
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

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

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // -- expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.previous.typ).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.typ).precedence {
            self.advance();
            let infix = Self::rule(self.previous.typ).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let interned = self.heap.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.typ {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::Nil => self.emit_op(OpCode::Nil),
            TokenType::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous);

        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.typ;
        self.parse_precedence(Self::rule(op).precedence.next());
        match op {
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
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

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.matches(TokenType::LeftParen) {
            // Property call in one instruction, skipping the bound-method
            // allocation a plain get would make.
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count
    }

    fn rule(typ: TokenType) -> ParseRule<'src, 'a> {
        use TokenType::*;

        let rule = |prefix: Option<ParseFn<'src, 'a>>,
                    infix: Option<ParseFn<'src, 'a>>,
                    precedence: Precedence| ParseRule {
            prefix,
            infix,
            precedence,
        };

        match typ {
            LeftParen => rule(Some(Self::grouping), Some(Self::call), Precedence::Call),
            Dot => rule(None, Some(Self::dot), Precedence::Call),
            Minus => rule(Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => rule(None, Some(Self::binary), Precedence::Term),
            Slash | Star => rule(None, Some(Self::binary), Precedence::Factor),
            Bang => rule(Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => rule(None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                rule(None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => rule(Some(Self::variable), None, Precedence::None),
            String => rule(Some(Self::string), None, Precedence::None),
            Number => rule(Some(Self::number), None, Precedence::None),
            And => rule(None, Some(Self::and_), Precedence::And),
            Or => rule(None, Some(Self::or_), Precedence::Or),
            False | Nil | True => rule(Some(Self::literal), None, Precedence::None),
            Super => rule(Some(Self::super_), None, Precedence::None),
            This => rule(Some(Self::this_), None, Precedence::None),
            _ => rule(None, None, Precedence::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Report;

    struct ErrorCollector {
        errors: Vec<String>,
    }

    impl ErrorCollector {
        fn new() -> Self {
            Self { errors: Vec::new() }
        }
    }

    impl Reporter for ErrorCollector {
        fn error(&mut self, report: Report) {
            self.errors.push(report.message);
        }
    }

    fn compile(source: &str) -> (Result<ObjRef, ()>, Heap, Vec<String>) {
        let mut heap = Heap::new();
        let mut reporter = ErrorCollector::new();
        let result = Compiler::new(source, &mut heap, &mut reporter).compile();
        (result, heap, reporter.errors)
    }

    fn first_error(source: &str) -> String {
        let (result, _, errors) = compile(source);
        assert!(result.is_err(), "expected {:?} to fail", source);
        errors.into_iter().next().unwrap()
    }

    #[test]
    fn arithmetic_lowers_to_stack_ops() {
        let (result, heap, errors) = compile("1 + 2 * 3;");
        assert!(errors.is_empty());
        let function = heap.function(result.unwrap());
        let expected: Vec<u8> = vec![
            OpCode::Constant.into(),
            0,
            OpCode::Constant.into(),
            1,
            OpCode::Constant.into(),
            2,
            OpCode::Multiply.into(),
            OpCode::Add.into(),
            OpCode::Pop.into(),
            OpCode::Nil.into(),
            OpCode::Return.into(),
        ];
        assert_eq!(function.chunk.code, expected);
    }

    #[test]
    fn comparison_pairs_compile_to_negations() {
        let (result, heap, _) = compile("1 <= 2;");
        let function = heap.function(result.unwrap());
        let tail = &function.chunk.code[4..6];
        assert_eq!(tail, [OpCode::Greater.into(), OpCode::Not.into()]);
    }

    #[test]
    fn missing_prefix_is_expect_expression() {
        assert!(first_error("+;").contains("Expect expression."));
    }

    #[test]
    fn invalid_assignment_target() {
        assert!(first_error("a + b = 1;").contains("Invalid assignment target."));
    }

    #[test]
    fn errors_carry_line_and_lexeme() {
        let error = first_error("1;\nvar = 2;");
        assert_eq!(error, "[line 2] Error at '=': Expect variable name.");
    }

    #[test]
    fn error_at_end_of_input() {
        let error = first_error("print 1");
        assert!(error.contains("Error at end"));
    }

    #[test]
    fn panic_mode_reports_once_per_statement() {
        let (_, _, errors) = compile("var 1 = 2 3;\nvar 4;");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn top_level_return_is_rejected() {
        assert!(first_error("return 1;").contains("Can't return from top-level code."));
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let error = first_error("class F { init() { return 1; } }");
        assert!(error.contains("Can't return a value from an initializer."));
    }

    #[test]
    fn bare_return_in_initializer_is_fine() {
        let (result, _, _) = compile("class F { init() { return; } }");
        assert!(result.is_ok());
    }

    #[test]
    fn this_outside_a_class() {
        assert!(first_error("print this;").contains("Can't use 'this' outside of a class."));
    }

    #[test]
    fn super_outside_a_class() {
        assert!(first_error("print super.x;").contains("Can't use 'super' outside of a class."));
    }

    #[test]
    fn super_without_superclass() {
        let error = first_error("class A { m() { super.m(); } }");
        assert!(error.contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        assert!(first_error("class A < A {}").contains("A class can't inherit from itself."));
    }

    #[test]
    fn local_self_reference_in_initializer() {
        let error = first_error("{ var a = a; }");
        assert!(error.contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn duplicate_local_in_same_scope() {
        let error = first_error("{ var a = 1; var a = 2; }");
        assert!(error.contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn shadowing_in_inner_scope_is_fine() {
        let (result, _, _) = compile("{ var a = 1; { var a = 2; } }");
        assert!(result.is_ok());
    }

    #[test]
    fn too_many_locals() {
        let mut body = String::new();
        for i in 0..300 {
            body += &format!("var l{} = 0; ", i);
        }
        let error = first_error(&format!("fun f() {{ {} }}", body));
        assert!(error.contains("Too many local variables in function."));
    }

    #[test]
    fn too_many_constants_in_one_chunk() {
        let mut body = String::new();
        for i in 0..300 {
            body += &format!("print {}.5; ", i);
        }
        let error = first_error(&format!("fun f() {{ {} }}", body));
        assert!(error.contains("Too many constants in one chunk."));
    }

    #[test]
    fn too_many_arguments() {
        // Local arguments keep the constant pool out of the picture, so the
        // arity limit is what trips.
        let args = vec!["a"; 256].join(", ");
        let error = first_error(&format!("fun g(a) {{ g({}); }}", args));
        assert!(error.contains("Can't have more than 255 arguments."));
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let error = first_error(&format!("fun f({}) {{}}", params.join(", ")));
        assert!(error.contains("Can't have more than 255 parameters."));
    }

    #[test]
    fn closures_record_upvalue_descriptors() {
        let source = "fun outer() { var x = 1; fun inner() { return x; } }";
        let (result, heap, errors) = compile(source);
        assert!(errors.is_empty());
        let script = heap.function(result.unwrap());
        // outer is the script's only function constant.
        let outer = script
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Obj(obj) => match heap.get(*obj) {
                    Obj::Function(f) if f.name.is_some() => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Obj(obj) => match heap.get(*obj) {
                    Obj::Function(f) if f.upvalue_count > 0 => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn control_flow_compiles() {
        let (result, _, errors) = compile(
            "var i = 0;\n\
             while (i < 10) { i = i + 1; }\n\
             for (var j = 0; j < 3; j = j + 1) print j;\n\
             if (i == 10 and true or false) print i; else print 0;",
        );
        assert!(errors.is_empty());
        assert!(result.is_ok());
    }
}
