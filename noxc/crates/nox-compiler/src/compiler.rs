//! Single-pass Pratt compiler: parses and emits bytecode in the same
//! walk, with no intermediate AST. Precedence climbing drives both
//! expression parsing and the handful of statement forms that are
//! themselves expression-shaped (assignment targets, call chains).

use nox_gc::{Chunk, GcRef, ObjFunction, OpCode, Runtime, Value};
use nox_util::Diagnostic;

use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Function,
    Method,
    Initializer,
    Script,
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FuncState<'src> {
    function: GcRef<ObjFunction>,
    ty: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FuncState<'src> {
    fn new(function: GcRef<ObjFunction>, ty: FunctionType) -> Self {
        // Slot 0 is reserved: `this` for methods/initializers, an
        // empty sentinel for plain functions and the top-level script.
        let name = if ty == FunctionType::Function || ty == FunctionType::Script {
            ""
        } else {
            "this"
        };
        FuncState {
            function,
            ty,
            locals: vec![Local {
                name: Token::synthetic(name),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src, 'rt> {
    runtime: &'rt mut Runtime,
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    states: Vec<FuncState<'src>>,
    classes: Vec<ClassState>,
}

pub fn compile(source: &str, runtime: &mut Runtime) -> Result<GcRef<ObjFunction>, Vec<Diagnostic>> {
    let function = runtime.heap.alloc_function();
    let mut compiler = Compiler {
        runtime,
        lexer: Lexer::new(source),
        previous: Token::synthetic(""),
        current: Token::synthetic(""),
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        states: vec![FuncState::new(function, FunctionType::Script)],
        classes: Vec::new(),
    };
    compiler.collect_checkpoint();
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let (function, _upvalues) = compiler.end();
    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(function)
    }
}

impl<'src, 'rt> Compiler<'src, 'rt> {
    fn state(&self) -> &FuncState<'src> {
        self.states.last().unwrap()
    }
    fn state_mut(&mut self) -> &mut FuncState<'src> {
        self.states.last_mut().unwrap()
    }
    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.get_mut_unchecked().chunk
    }

    // ----- token stream -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

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
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.diagnostics.push(Diagnostic::error(token.line, location, message));
        self.had_error = true;
    }

    // ----- emission -----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_bytes(op as u8, byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.chunk().code[offset] = ((jump >> 8) & 0xff) as u8;
        self.chunk().code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_return(&mut self) {
        if self.state().ty == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let mut chunk = std::mem::take(self.chunk());
        let index = self.runtime.add_constant(&mut chunk, value);
        *self.chunk() = chunk;
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, index);
    }

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        let depth = self.state().scope_depth;
        loop {
            let is_captured = match self.state().locals.last() {
                Some(local) if local.depth > depth => local.is_captured,
                _ => break,
            };
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    // ----- variables -----

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let bytes = name.as_bytes();
        let interned = self.runtime.intern_string(bytes);
        let constant = self.make_constant(Value::Obj(interned.as_obj_ref()));
        self.collect_checkpoint();
        constant
    }

    fn identifiers_equal(a: &str, b: &str) -> bool {
        a == b
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let found = {
            let locals = &self.state().locals;
            locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, l)| Self::identifiers_equal(l.name.lexeme, name))
                .map(|(i, l)| (i as u8, l.depth))
        };
        let (index, depth) = found?;
        if depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(index)
    }

    fn add_upvalue(state: &mut FuncState<'src>, index: u8, is_local: bool) -> Result<u8, ()> {
        for (i, up) in state.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if state.upvalues.len() == 256 {
            return Err(());
        }
        state.upvalues.push(UpvalueDesc { index, is_local });
        state.function.get_mut_unchecked().upvalue_count = state.upvalues.len() as u8;
        Ok((state.upvalues.len() - 1) as u8)
    }

    /// Walks the compiler stack outward from `depth` looking for
    /// `name` as a local in an enclosing function, threading an
    /// upvalue through every intervening function so each frame only
    /// ever captures from its immediate parent.
    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> Option<u8> {
        if depth == 0 {
            return None;
        }
        let enclosing = depth - 1;
        if let Some(local_index) = {
            let locals = &self.states[enclosing].locals;
            locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, l)| Self::identifiers_equal(l.name.lexeme, name))
                .map(|(i, _)| i as u8)
        } {
            self.states[enclosing].locals[local_index as usize].is_captured = true;
            return match Self::add_upvalue(&mut self.states[depth], local_index, true) {
                Ok(i) => Some(i),
                Err(()) => {
                    self.error("Too many closure variables in function.");
                    None
                }
            };
        }
        if let Some(upvalue_index) = self.resolve_upvalue(enclosing, name) {
            return match Self::add_upvalue(&mut self.states[depth], upvalue_index, false) {
                Ok(i) => Some(i),
                Err(()) => {
                    self.error("Too many closure variables in function.");
                    None
                }
            };
        }
        None
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.state().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let depth = self.state().scope_depth;
        let duplicate = {
            let locals = &self.state().locals;
            let mut found = false;
            for local in locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if Self::identifiers_equal(local.name.lexeme, name.lexeme) {
                    found = true;
                    break;
                }
            }
            found
        };
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let lexeme = self.previous.lexeme.to_string();
        self.identifier_constant(&lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let depth = self.state().scope_depth;
        self.state_mut().locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let depth = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(name) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(up) = self.resolve_upvalue(depth, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, up)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ----- expressions -----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= Self::precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn precedence_of(kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Minus | Plus => Precedence::Term,
            Slash | Star => Precedence::Factor,
            BangEqual | EqualEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            LeftParen | Dot | LeftBracket => Precedence::Call,
            And => Precedence::And,
            Or => Precedence::Or,
            _ => Precedence::None,
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            False | True | Nil => self.literal(),
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            LeftBracket => self.list_literal(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Minus | Plus | Slash | Star | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(),
            And => self.and_(),
            Or => self.or_(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            LeftBracket => self.subscript(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let n: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(n));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let bytes = lexeme[1..lexeme.len() - 1].as_bytes().to_vec();
        let interned = self.runtime.intern_string(&bytes);
        self.emit_constant(Value::Obj(interned.as_obj_ref()));
        self.collect_checkpoint();
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&name);
        self.named_variable("this", false);
        self.named_variable("super", false);
        self.emit_op_byte(OpCode::GetSuper, name_constant);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Call, arg_count);
        }
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        let rule_precedence = Self::precedence_of(op_kind);
        self.parse_precedence(rule_precedence.next());
        match op_kind {
            TokenKind::BangEqual => self.emit_bytes(OpCode::Equal as u8, OpCode::Not as u8),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_bytes(OpCode::Less as u8, OpCode::Not as u8),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_bytes(OpCode::Greater as u8, OpCode::Not as u8),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&name);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name_constant);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name_constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name_constant);
        }
    }

    /// `[` is both the list-literal prefix and the index postfix;
    /// this method handles the postfix/infix role (`expr[index]`).
    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::StoreSubscr);
        } else {
            self.emit_op(OpCode::IndexSubscr);
        }
    }

    fn list_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 items in a list literal.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list literal.");
        self.emit_op_byte(OpCode::BuildList, count as u8);
    }

    // ----- statements -----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
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
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
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

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
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
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().ty == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().ty == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ty: FunctionType) {
        let name_lexeme = self.previous.lexeme.to_string();
        let name = self.runtime.intern_string(name_lexeme.as_bytes());
        let function = self.runtime.heap.alloc_function();
        function.get_mut_unchecked().name = Some(name);
        self.states.push(FuncState::new(function, ty));
        self.collect_checkpoint();
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.state().function.get().arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.state_mut().function.get_mut_unchecked().arity += 1;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (compiled, upvalues) = self.end();
        let constant = self.make_constant(Value::Obj(compiled.as_obj_ref()));
        self.emit_op_byte(OpCode::Closure, constant);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    /// Emits the implicit return, pops the finished `FuncState`, and
    /// hands back both the completed function and the upvalue
    /// descriptors recorded while compiling its body — the latter
    /// only exist on the state we're about to discard.
    fn end(&mut self) -> (GcRef<ObjFunction>, Vec<UpvalueDesc>) {
        self.emit_return();
        let finished = self.states.pop().unwrap();
        (finished.function, finished.upvalues)
    }

    /// Checks the heap's collection threshold, marking every
    /// in-progress function on the state stack as a root first: those
    /// functions aren't reachable through `Runtime`'s own roots (the
    /// stack/globals/frames the VM uses) since nothing has run yet.
    fn collect_checkpoint(&mut self) {
        let live: Vec<GcRef<ObjFunction>> = self.states.iter().map(|s| s.function).collect();
        self.runtime.maybe_collect_with(|heap| {
            for function in &live {
                heap.mark_object(function.as_obj_ref());
            }
        });
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let class_name_str = class_name.lexeme.to_string();
        let name_constant = self.identifier_constant(&class_name_str);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            self.variable(false);
            if Self::identifiers_equal(&class_name_str, &super_name) {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);

            self.named_variable(&class_name_str, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name_str, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);
        let ty = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(ty);
        self.emit_op_byte(OpCode::Method, constant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nox_gc::ObjKind;

    fn compile_ok(source: &str) -> (GcRef<ObjFunction>, Runtime) {
        let mut runtime = Runtime::new();
        let function = compile(source, &mut runtime).expect("expected compile to succeed");
        (function, runtime)
    }

    /// Walks a chunk's bytecode into its opcodes, skipping each
    /// instruction's operand bytes. `Closure`'s operand width depends
    /// on the referenced function's upvalue count, so decoding it
    /// needs the chunk's constant pool.
    fn opcodes(function: GcRef<ObjFunction>) -> Vec<OpCode> {
        let chunk = &function.get().chunk;
        let mut ops = Vec::new();
        let mut ip = 0;
        while ip < chunk.code.len() {
            let op = OpCode::from_u8(chunk.code[ip]);
            ip += 1;
            ops.push(op);
            ip += match op {
                OpCode::Nil
                | OpCode::True
                | OpCode::False
                | OpCode::Pop
                | OpCode::Equal
                | OpCode::Greater
                | OpCode::Less
                | OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Not
                | OpCode::Negate
                | OpCode::Print
                | OpCode::CloseUpvalue
                | OpCode::Return
                | OpCode::Inherit
                | OpCode::IndexSubscr
                | OpCode::StoreSubscr => 0,
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
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop | OpCode::Invoke => 2,
                OpCode::Closure => {
                    let constant_index = chunk.code[ip] as usize;
                    let nested = match chunk.constants[constant_index] {
                        Value::Obj(obj) => unsafe { obj.downcast::<ObjFunction>() },
                        _ => unreachable!("CLOSURE operand is always a function constant"),
                    };
                    1 + 2 * nested.get().upvalue_count as usize
                }
            };
        }
        ops
    }

    /// Gathers `function` and every function nested inside its constant
    /// pool, transitively, so tests can inspect a method's own body
    /// without manually walking closures to find it.
    fn all_functions(function: GcRef<ObjFunction>) -> Vec<GcRef<ObjFunction>> {
        let mut out = vec![function];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            for constant in &current.get().chunk.constants {
                if let Value::Obj(obj) = constant {
                    if obj.kind() == ObjKind::Function {
                        out.push(unsafe { obj.downcast::<ObjFunction>() });
                    }
                }
            }
            i += 1;
        }
        out
    }

    #[test]
    fn class_declaration_emits_class_define_and_method() {
        let (script, _runtime) = compile_ok("class A { greet() { print 1; } }");
        assert_eq!(
            opcodes(script),
            vec![
                OpCode::Class,
                OpCode::DefineGlobal,
                OpCode::GetGlobal,
                OpCode::Closure,
                OpCode::Method,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn subclass_emits_inherit_before_method_binding() {
        let (script, _runtime) = compile_ok(
            r#"
            class A { greet() { print "hi"; } }
            class B < A { greet() { print "hi"; } }
            "#,
        );
        let ops = opcodes(script);
        let inherit_pos = ops.iter().position(|op| *op == OpCode::Inherit);
        let method_pos = ops.iter().rposition(|op| *op == OpCode::Method);
        assert!(inherit_pos.is_some(), "expected an Inherit instruction: {ops:?}");
        assert!(inherit_pos.unwrap() < method_pos.unwrap());
    }

    #[test]
    fn super_call_emits_get_super_then_call() {
        let (script, _runtime) = compile_ok(
            r#"
            class A { greet() { print "hi"; } }
            class B < A {
                greet() { super.greet(); }
            }
            "#,
        );
        let method_ops: Vec<OpCode> = all_functions(script)
            .into_iter()
            .map(opcodes)
            .find(|ops| ops.contains(&OpCode::GetSuper))
            .unwrap_or_default();
        let super_pos = method_ops
            .iter()
            .position(|op| *op == OpCode::GetSuper)
            .unwrap_or_else(|| panic!("expected a GetSuper instruction among {method_ops:?}"));
        assert_eq!(method_ops.get(super_pos + 1), Some(&OpCode::Call));
    }

    #[test]
    fn bare_super_access_emits_get_super() {
        let (script, _runtime) = compile_ok(
            r#"
            class A { greet() { print "hi"; } }
            class B < A {
                greet() {
                    var method = super.greet;
                }
            }
            "#,
        );
        let all_ops: Vec<OpCode> = all_functions(script)
            .into_iter()
            .flat_map(opcodes)
            .collect();
        assert!(
            all_ops.contains(&OpCode::GetSuper),
            "expected a GetSuper instruction among {all_ops:?}"
        );
    }

    #[test]
    fn list_literal_emits_build_list_with_item_count() {
        let (script, _runtime) = compile_ok("var xs = [1, 2, 3];");
        let ops = opcodes(script);
        assert!(ops.contains(&OpCode::BuildList));

        let chunk = &script.get().chunk;
        let mut ip = 0;
        let mut build_list_count = None;
        while ip < chunk.code.len() {
            let op = OpCode::from_u8(chunk.code[ip]);
            if op == OpCode::BuildList {
                build_list_count = Some(chunk.code[ip + 1]);
                break;
            }
            ip += 1;
        }
        assert_eq!(build_list_count, Some(3));
    }

    #[test]
    fn empty_list_literal_emits_zero_count() {
        let (script, _runtime) = compile_ok("var xs = [];");
        let chunk = &script.get().chunk;
        let build_list_at = chunk
            .code
            .iter()
            .position(|&b| OpCode::from_u8(b) == OpCode::BuildList)
            .expect("expected a BuildList instruction");
        assert_eq!(chunk.code[build_list_at + 1], 0);
    }
}
