// (C) 2020 Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Single-pass Pratt parser. There is no separate AST: every expression
// and statement emits bytecode directly into the innermost
// `FunctionBuilder` as it is recognized. Register allocation is
// deliberately simple rather than optimal - every expression sub-node
// gets a fresh temp register, and registers are only reclaimed at
// statement boundaries. This means a function's `needed_stack_space`
// is an over-approximation of what any single call path actually
// touches, which is exactly what spec.md 4.5 permits.

use std::collections::HashMap;

use crate::builder::{ConstLit, FunctionBuilder};
use crate::error::CompileError;
use crate::instruction::{
    Insn, Op, LOAD_BASIC_CONST_OFFSET, LOAD_BASIC_CURRENT_MODULE, LOAD_BASIC_FALSE,
    LOAD_BASIC_NULL, LOAD_BASIC_TRUE,
};
use crate::lexer::{Keyword, Lexer, Token, TokenKind};
use crate::object::ObjClass;
use crate::object::ObjKind;
use crate::symbol::SymbolId;
use crate::value::{ObjIndex, Value};
use crate::vm::Vm;

const PREC_NONE: u8 = 0;
const PREC_ASSIGN: u8 = 1;
const PREC_OR: u8 = 2;
const PREC_AND: u8 = 3;
const PREC_EQUALITY: u8 = 4;
const PREC_COMPARISON: u8 = 5;
const PREC_TERM: u8 = 6;
const PREC_FACTOR: u8 = 7;
const PREC_UNARY: u8 = 8;
const PREC_CALL: u8 = 9;

/// Where a just-parsed expression's value came from, so an enclosing
/// assignment knows how to write back to it.
#[derive(Copy, Clone)]
enum Place {
    Local(u16),
    Global(SymbolId),
    Field { container: u16, symbol: SymbolId },
    /// `obj[idx]` - not a plain symbol store, so assignment to it goes
    /// through the `[]=` method instead of `store_to_place`.
    Index { container: u16, index: u16 },
    None,
}

#[derive(Copy, Clone)]
struct ExprInfo {
    reg: u16,
    place: Place,
}

impl ExprInfo {
    fn value(reg: u16) -> ExprInfo {
        ExprInfo {
            reg,
            place: Place::None,
        }
    }
}

/// Whether a method body being compiled binds register 1 as `self`.
#[derive(Copy, Clone, PartialEq)]
enum Receiver {
    /// Not a method body at all (a free `func` or the module body).
    None,
    /// Instance method - register 1 is bound to the local `self`.
    Bound,
    /// Static method - register 1 is reserved (for arity/call-site
    /// uniformity) but left unnamed.
    Unbound,
}

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    module: ObjIndex,
    errors: Vec<CompileError>,
    has_error: bool,
    builders: Vec<FunctionBuilder>,
    loop_depth_stack: Vec<u32>,
    classes_by_name: HashMap<String, ObjIndex>,
    /// Class object(s) currently being parsed, outermost first. A class
    /// body can nest an `import` inside a method's block (statements
    /// don't care what container they're compiled in), so this has to be
    /// a stack, not a single `Option`, to stay correct for that case.
    class_stack: Vec<ObjClass>,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str, module: ObjIndex) -> Self {
        let lexer = Lexer::new(source, Keyword::table());
        let sentinel = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
            number: 0.0,
        };
        Parser {
            lexer,
            current: sentinel,
            previous: sentinel,
            module,
            errors: Vec::new(),
            has_error: false,
            builders: Vec::new(),
            loop_depth_stack: Vec::new(),
            classes_by_name: HashMap::new(),
            class_stack: Vec::new(),
        }
    }

    /// Compiles the whole source as the module's implicit top-level
    /// function and returns it unattached - the caller (`Vm::exec_in_module`)
    /// is the one that actually runs it.
    pub fn compile_module(&mut self, vm: &mut Vm) -> (ObjIndex, Vec<CompileError>) {
        self.advance();
        self.builders.push(FunctionBuilder::new(None));
        self.loop_depth_stack.push(0);
        self.cur_builder().push_temp(1); // reserved return slot, register 0
        while !self.check(TokenKind::Eof) {
            self.statement(vm);
        }
        let line = self.current.line;
        self.emit_implicit_return(line);
        let builder = self.builders.pop().unwrap();
        self.loop_depth_stack.pop();
        let (objfn, _name) = builder.finish(0, self.module, &mut vm.heap);
        let idx = vm.heap.alloc(ObjKind::Function(objfn));
        (idx, std::mem::take(&mut self.errors))
    }

    // --- token / error plumbing --------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            if let Some((line, msg)) = self.lexer.error.take() {
                self.errors.push(CompileError::new(line, msg));
            } else {
                self.errors
                    .push(CompileError::new(self.current.line, "lexer error".to_string()));
            }
            self.has_error = true;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn check_kw(&self, kw: Keyword) -> bool {
        self.current.kind == TokenKind::Keyword(kw)
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_kw(&mut self, kw: Keyword) -> bool {
        self.match_tok(TokenKind::Keyword(kw))
    }

    fn expect(&mut self, kind: TokenKind, msg: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            let line = self.current.line;
            self.error(line, msg.to_string());
        }
    }

    fn expect_identifier(&mut self, msg: &str) -> String {
        if self.check(TokenKind::Identifier) {
            let name = self.current.lexeme.to_string();
            self.advance();
            name
        } else {
            let line = self.current.line;
            self.error(line, msg.to_string());
            String::new()
        }
    }

    fn error(&mut self, line: i32, msg: impl Into<String>) {
        let slice = self.lexer.current_line_slice();
        self.errors
            .push(CompileError::new(line, format!("{} (near: `{}`)", msg.into(), slice)));
        self.has_error = true;
        self.synchronize();
    }

    fn synchronize(&mut self) {
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if self.check(TokenKind::RBrace) {
                return;
            }
            self.advance();
        }
    }

    fn cur_builder(&mut self) -> &mut FunctionBuilder {
        self.builders
            .last_mut()
            .expect("parser must be inside a function context")
    }

    fn emit(&mut self, insn: Insn, line: i32) -> usize {
        self.cur_builder().emit(insn, line)
    }

    fn is_module_scope(&self) -> bool {
        self.builders.len() == 1
    }

    fn intern(&mut self, vm: &mut Vm, name: &str) -> SymbolId {
        vm.symbols.intern(name)
    }

    // --- statements ---------------------------------------------------------

    fn statement(&mut self, vm: &mut Vm) {
        if self.check_kw(Keyword::Var) {
            self.var_decl(vm);
        } else if self.check_kw(Keyword::Func) {
            self.func_decl(vm);
        } else if self.check_kw(Keyword::Class) {
            self.class_decl(vm);
        } else if self.check_kw(Keyword::Import) {
            self.import_stmt(vm);
        } else if self.check_kw(Keyword::If) {
            self.if_stmt(vm);
        } else if self.check_kw(Keyword::While) {
            self.while_stmt(vm);
        } else if self.check_kw(Keyword::For) {
            self.for_stmt(vm);
        } else if self.check_kw(Keyword::Break) {
            self.break_stmt();
        } else if self.check_kw(Keyword::Return) {
            self.return_stmt(vm);
        } else if self.check(TokenKind::LBrace) {
            self.cur_builder().push_scope();
            self.block_stmt(vm);
            self.cur_builder().pop_scope();
        } else {
            self.expr_stmt(vm);
        }
    }

    fn var_decl(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `var`
        let name = self.expect_identifier("expected variable name after 'var'");
        let mark = self.cur_builder().locals_len() as u16;
        let info = if self.match_tok(TokenKind::Eq) {
            self.expression(vm)
        } else {
            self.null_literal(line)
        };
        self.expect(TokenKind::Semicolon, "expected ';' after variable declaration");
        self.declare_value_in_scope(vm, &name, info.reg, mark, line);
    }

    /// Copies a value sitting at `reg` down to `mark` (if it isn't
    /// already there), collapses every temp above `mark` and binds the
    /// result as `name` - either a module global or a local, depending
    /// on nesting depth.
    fn declare_value_in_scope(&mut self, vm: &mut Vm, name: &str, reg: u16, mark: u16, line: i32) {
        if reg != mark {
            self.emit(Insn::abx(Op::StoreMove, mark, reg as u32), line);
        }
        self.cur_builder().pop_temp(mark as usize + 1);
        if self.is_module_scope() {
            let sym = self.intern(vm, name);
            let mod_reg = self.cur_builder().push_temp(1) as u16;
            self.emit(
                Insn::abx(Op::LoadBasic, mod_reg, LOAD_BASIC_CURRENT_MODULE),
                line,
            );
            self.emit(
                Insn::abc(Op::StoreSymbol, mod_reg, sym.0 as u16, mark),
                line,
            );
            self.cur_builder().pop_temp(mark as usize + 1);
        } else {
            let _ = self.cur_builder().declare_temp_as_local(mark as usize, name);
        }
    }

    fn func_decl(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `func`
        let name = self.expect_identifier("expected function name after 'func'");
        let mark = self.cur_builder().locals_len() as u16;
        let params = self.parse_param_list();
        let fn_idx = self.compile_function_body(vm, Some(name.clone()), &params, Receiver::None);
        let const_idx = self
            .cur_builder()
            .add_constant(ConstLit::Obj(Value::from_ptr(fn_idx)));
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abx(Op::LoadBasic, dest, LOAD_BASIC_CONST_OFFSET + const_idx),
            line,
        );
        self.declare_value_in_scope(vm, &name, dest, mark, line);
    }

    fn parse_param_list(&mut self) -> Vec<String> {
        self.expect(TokenKind::LParen, "expected '(' after function name");
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                params.push(self.expect_identifier("expected parameter name"));
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after parameter list");
        params
    }

    /// Compiles `{ ... }` as a brand-new function: pushes a fresh
    /// `FunctionBuilder`, reserves register 0 (return slot) and, per
    /// `receiver`, register 1 (the method receiver), then one register
    /// per declared parameter, before compiling the body block.
    fn compile_function_body(
        &mut self,
        vm: &mut Vm,
        name: Option<String>,
        params: &[String],
        receiver: Receiver,
    ) -> ObjIndex {
        self.builders.push(FunctionBuilder::new(name));
        self.loop_depth_stack.push(0);
        self.cur_builder().push_temp(1); // register 0: reserved return slot
        let mut arity = 0u8;
        match receiver {
            Receiver::None => {}
            Receiver::Bound => {
                self.cur_builder().decl_local("self");
                arity += 1;
            }
            Receiver::Unbound => {
                self.cur_builder().push_temp(1);
                arity += 1;
            }
        }
        for p in params {
            self.cur_builder().decl_local(p);
            arity += 1;
        }
        self.expect(TokenKind::LBrace, "expected '{' to begin function body");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.statement(vm);
        }
        let line = self.current.line;
        self.expect(TokenKind::RBrace, "expected '}' to close function body");
        self.emit_implicit_return(line);
        let builder = self.builders.pop().unwrap();
        self.loop_depth_stack.pop();
        let (mut objfn, fn_name) = builder.finish(arity, self.module, &mut vm.heap);
        if let Some(n) = fn_name {
            objfn.name = Some(vm.alloc_string(n).as_ptr());
        }
        vm.heap.alloc(ObjKind::Function(objfn))
    }

    fn emit_implicit_return(&mut self, line: i32) {
        self.emit(Insn::abx(Op::Return, 0, 0), line);
    }

    fn class_decl(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `class`
        let name = self.expect_identifier("expected class name after 'class'");
        let name_val = vm.alloc_string(name.clone());
        let mut class_obj = ObjClass::new(name_val.as_ptr(), self.module);
        if self.match_tok(TokenKind::Colon) {
            let base_name = self.expect_identifier("expected base class name after ':'");
            match self.classes_by_name.get(&base_name) {
                Some(idx) => class_obj.base_clz = Some(*idx),
                None => self.error(line, format!("unknown base class '{}'", base_name)),
            }
        }
        // Pushed onto a stack, not held as a plain local: a method body
        // compiled below can itself contain an `import` that triggers a
        // nested module execution and a real GC cycle, at which point
        // this not-yet-heap-allocated class (and its already-compiled
        // members) needs to be a root - see `class_stack_roots`.
        self.class_stack.push(class_obj);
        self.expect(TokenKind::LBrace, "expected '{' to begin class body");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.class_member(vm);
        }
        self.expect(TokenKind::RBrace, "expected '}' to close class body");
        let class_obj = self.class_stack.pop().expect("class_decl pushed exactly one");
        let class_idx = vm.heap.alloc(ObjKind::Class(class_obj));
        self.classes_by_name.insert(name.clone(), class_idx);

        let mark = self.cur_builder().locals_len() as u16;
        let const_idx = self
            .cur_builder()
            .add_constant(ConstLit::Obj(Value::from_ptr(class_idx)));
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abx(Op::LoadBasic, dest, LOAD_BASIC_CONST_OFFSET + const_idx),
            line,
        );
        self.declare_value_in_scope(vm, &name, dest, mark, line);
    }

    /// One class body member: `var name = constexpr;`, `static var name
    /// = constexpr;`, `func name(...) {...}` or `static func name(...)
    /// {...}`, including the `[]`/`[]=` subscript-operator spelling.
    fn class_member(&mut self, vm: &mut Vm) {
        let is_static = self.match_kw(Keyword::Static);
        if self.match_kw(Keyword::Var) {
            let name = self.expect_identifier("expected field name");
            self.expect(TokenKind::Eq, "expected '=' in field declaration");
            let value = self.parse_constexpr(vm);
            self.expect(TokenKind::Semicolon, "expected ';' after field declaration");
            let sym = self.intern(vm, &name);
            let class_obj = self.class_stack.last_mut().expect("inside class_decl");
            if is_static {
                class_obj.symbols.insert(sym, value);
            } else {
                class_obj.field_initializers.push((sym, value));
            }
        } else if self.match_kw(Keyword::Func) {
            let method_name = self.method_name();
            let receiver = if is_static {
                Receiver::Unbound
            } else {
                Receiver::Bound
            };
            let params = self.parse_param_list();
            // The function body is compiled while this class is still
            // mid-construction on `class_stack`, so any nested `import`
            // inside it sees the class rooted there.
            let fn_idx =
                self.compile_function_body(vm, Some(method_name.clone()), &params, receiver);
            let sym = self.intern(vm, &method_name);
            let class_obj = self.class_stack.last_mut().expect("inside class_decl");
            if method_name == "dtor" {
                class_obj.finalizer = Some(sym);
            }
            class_obj.symbols.insert(sym, Value::from_ptr(fn_idx));
        } else {
            let line = self.current.line;
            self.error(line, "expected 'var' or 'func' in class body");
        }
    }

    /// Every heap object reachable from classes currently mid-construction
    /// (outer `class` bodies enclosing the point of an `import`), for GC
    /// rooting - see `push_pending_roots`.
    fn class_stack_roots(&self) -> impl Iterator<Item = ObjIndex> + '_ {
        self.class_stack.iter().flat_map(|c| {
            let name = std::iter::once(c.name);
            let base = c.base_clz.into_iter();
            let sym_vals = c
                .symbols
                .values()
                .filter(|v| v.is_ptr())
                .map(|v| v.as_ptr());
            let field_vals = c
                .field_initializers
                .iter()
                .filter(|(_, v)| v.is_ptr())
                .map(|(_, v)| v.as_ptr());
            name.chain(base).chain(sym_vals).chain(field_vals)
        })
    }

    /// Roots everything this in-progress parser holds that isn't
    /// reachable from any other GC root: every builder on the function
    /// stack's constant pool, every class already finished and named,
    /// and every class still mid-construction. Returns a mark to pass to
    /// `vm.truncate_parser_roots` once the caller's nested execution
    /// (which may trigger a real GC cycle) returns.
    fn push_pending_roots(&self, vm: &mut Vm) -> usize {
        let mark = vm.parser_roots_mark();
        let builder_roots = self.builders.iter().flat_map(|b| b.root_objects());
        let class_roots = self.classes_by_name.values().copied();
        let in_progress_roots = self.class_stack_roots();
        vm.push_parser_roots(builder_roots.chain(class_roots).chain(in_progress_roots));
        mark
    }

    /// A class member function may be named with the subscript sugar
    /// (`[]` / `[]=`) instead of a plain identifier.
    fn method_name(&mut self) -> String {
        if self.match_tok(TokenKind::LBracket) {
            self.expect(TokenKind::RBracket, "expected ']' after '['");
            if self.match_tok(TokenKind::Eq) {
                "[]=".to_string()
            } else {
                "[]".to_string()
            }
        } else {
            self.expect_identifier("expected method name")
        }
    }

    /// `constexpr := [-] (Number | StringLit | 'true' | 'false' | 'nil')`.
    fn parse_constexpr(&mut self, vm: &mut Vm) -> Value {
        let negate = self.match_tok(TokenKind::Minus);
        let v = if self.check(TokenKind::Number) {
            let n = self.current.number;
            self.advance();
            Value::from_num(n)
        } else if self.check(TokenKind::StringLit) {
            let raw = self.current.lexeme;
            let s = crate::object::unescape(raw);
            self.advance();
            vm.alloc_string(s)
        } else if self.match_kw(Keyword::True) {
            Value::from_bool(true)
        } else if self.match_kw(Keyword::False) {
            Value::from_bool(false)
        } else if self.match_kw(Keyword::Null) {
            Value::null()
        } else {
            let line = self.current.line;
            self.error(line, "expected a constant expression");
            Value::null()
        };
        if negate && v.is_num() {
            Value::from_num(-v.as_num())
        } else {
            v
        }
    }

    fn importer_module_name(&self, vm: &Vm) -> String {
        match vm.heap.kind(self.module) {
            Some(ObjKind::Module(m)) => match vm.heap.kind(m.name) {
                Some(ObjKind::String(s)) => s.value.clone(),
                _ => String::new(),
            },
            _ => String::new(),
        }
    }

    /// `import "modname" for a, b as c, ...;`. Resolved eagerly: the
    /// named module is compiled and run right now (if it hasn't been
    /// already), and every requested binding is read out of its
    /// finished globals and baked into this module's constant pool -
    /// there is no bytecode import instruction.
    fn import_stmt(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `import`
        let path_tok = self.current;
        if !self.check(TokenKind::StringLit) {
            self.error(line, "expected a module path string after 'import'");
            return;
        }
        let imported_name = crate::object::unescape(path_tok.lexeme);
        self.advance();
        self.expect(
            TokenKind::Keyword(Keyword::For),
            "expected 'for' after import path",
        );

        let mut bindings: Vec<(String, String)> = Vec::new();
        loop {
            let exported = self.expect_identifier("expected an imported name");
            let local = if self.match_kw(Keyword::As) {
                self.expect_identifier("expected a name after 'as'")
            } else {
                exported.clone()
            };
            bindings.push((exported, local));
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Semicolon, "expected ';' after import list");

        if vm.module_by_name(&imported_name).is_none() {
            let importer = self.importer_module_name(vm);
            let src = match vm.on_module_lookup {
                Some(cb) => cb(vm, &importer, &imported_name),
                None => None,
            };
            match src {
                Some(source) => {
                    // `exec_in_module` runs the imported module's top-level
                    // code right now and can trigger a real GC cycle; this
                    // parser's own in-progress, not-yet-attached objects
                    // (pending classes, nested function constants) must be
                    // rooted across that call.
                    let mark = self.push_pending_roots(vm);
                    let result = vm.exec_in_module(&imported_name, &source);
                    vm.truncate_parser_roots(mark);
                    if result.is_err() {
                        self.error(line, format!("failed to import module '{}'", imported_name));
                        return;
                    }
                }
                None => {
                    self.error(line, format!("could not resolve module '{}'", imported_name));
                    return;
                }
            }
        }
        let module_idx = match vm.module_by_name(&imported_name) {
            Some(idx) => idx,
            None => return,
        };

        for (exported, local) in bindings {
            let sym = self.intern(vm, &exported);
            let value = match vm.heap.kind(module_idx) {
                Some(ObjKind::Module(m)) => m.variables.get(&sym).copied(),
                _ => None,
            };
            let value = match value {
                Some(v) => v,
                None => {
                    self.error(
                        line,
                        format!("module '{}' has no export '{}'", imported_name, exported),
                    );
                    continue;
                }
            };
            let mark = self.cur_builder().locals_len() as u16;
            let const_idx = self.cur_builder().add_constant(ConstLit::Obj(value));
            let dest = self.cur_builder().push_temp(1) as u16;
            self.emit(
                Insn::abx(Op::LoadBasic, dest, LOAD_BASIC_CONST_OFFSET + const_idx),
                line,
            );
            self.declare_value_in_scope(vm, &local, dest, mark, line);
        }
    }

    fn if_stmt(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `if`
        self.expect(TokenKind::LParen, "expected '(' after 'if'");
        let mark = self.cur_builder().locals_len() as u16;
        let cond = self.expression(vm);
        self.expect(TokenKind::RParen, "expected ')' after condition");
        let jump_if_not = self.emit(Insn::asbx(Op::JumpIfNot, cond.reg, 0), line);
        self.cur_builder().pop_temp(mark as usize);
        self.statement(vm);
        if self.match_kw(Keyword::Else) {
            let else_jump_line = self.current.line;
            let jump_over_else = self.emit(Insn::asbx(Op::Jump, 0, 0), else_jump_line);
            let else_target = self.cur_builder().here();
            self.patch_jump_if_not(jump_if_not, cond.reg, else_target);
            self.statement(vm);
            let end = self.cur_builder().here();
            self.patch_jump(jump_over_else, end);
        } else {
            let end = self.cur_builder().here();
            self.patch_jump_if_not(jump_if_not, cond.reg, end);
        }
    }

    fn patch_jump(&mut self, ip: usize, target: usize) {
        let offset = target as i32 - (ip as i32 + 1);
        self.cur_builder().patch(ip, Insn::asbx(Op::Jump, 0, offset));
    }

    fn patch_jump_if_not(&mut self, ip: usize, cond_reg: u16, target: usize) {
        let offset = target as i32 - (ip as i32 + 1);
        self.cur_builder()
            .patch(ip, Insn::asbx(Op::JumpIfNot, cond_reg, offset));
    }

    fn while_stmt(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `while`
        self.expect(TokenKind::LParen, "expected '(' after 'while'");
        let loop_start = self.cur_builder().here();
        let mark = self.cur_builder().locals_len() as u16;
        let cond = self.expression(vm);
        self.expect(TokenKind::RParen, "expected ')' after condition");
        let jump_out = self.emit(Insn::asbx(Op::JumpIfNot, cond.reg, 0), line);
        self.cur_builder().pop_temp(mark as usize);
        *self.loop_depth_stack.last_mut().unwrap() += 1;
        let break_range_start = self.cur_builder().here();
        self.statement(vm);
        let back_line = self.current.line;
        let jump_back_ip = self.cur_builder().here();
        let offset = loop_start as i32 - (jump_back_ip as i32 + 1);
        self.emit(Insn::asbx(Op::Jump, 0, offset), back_line);
        let end = self.cur_builder().here();
        self.patch_jump_if_not(jump_out, cond.reg, end);
        let break_range_end = self.cur_builder().here();
        self.cur_builder()
            .patch_breaks_in_range(break_range_start, break_range_end, end);
        *self.loop_depth_stack.last_mut().unwrap() -= 1;
    }

    /// C-style `for (init; cond; incr) body`. Emitted so the increment
    /// sits textually right after the condition (jumped over once) and
    /// the body jumps back to the increment rather than the condition -
    /// keeps the whole thing single-pass without a separate patch-up
    /// buffer for the increment clause.
    fn for_stmt(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `for`
        self.expect(TokenKind::LParen, "expected '(' after 'for'");
        self.cur_builder().push_scope();
        if self.check_kw(Keyword::Var) {
            self.var_decl(vm);
        } else if !self.match_tok(TokenKind::Semicolon) {
            let mark = self.cur_builder().locals_len() as u16;
            self.expression(vm);
            self.cur_builder().pop_temp(mark as usize);
            self.expect(TokenKind::Semicolon, "expected ';' after for-loop initializer");
        }

        let loop_start = self.cur_builder().here();
        let cond_mark = self.cur_builder().locals_len() as u16;
        let has_cond = !self.check(TokenKind::Semicolon);
        let cond_reg = if has_cond {
            Some(self.expression(vm).reg)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "expected ';' after for-loop condition");
        let jump_out = cond_reg.map(|r| self.emit(Insn::asbx(Op::JumpIfNot, r, 0), line));
        if has_cond {
            self.cur_builder().pop_temp(cond_mark as usize);
        }

        let inc_skip = self.emit(Insn::asbx(Op::Jump, 0, 0), line);
        let inc_start = self.cur_builder().here();
        let inc_mark = self.cur_builder().locals_len() as u16;
        if !self.check(TokenKind::RParen) {
            self.expression(vm);
            self.cur_builder().pop_temp(inc_mark as usize);
        }
        let inc_back_line = self.current.line;
        let inc_back_ip = self.cur_builder().here();
        let offset = loop_start as i32 - (inc_back_ip as i32 + 1);
        self.emit(Insn::asbx(Op::Jump, 0, offset), inc_back_line);
        self.expect(TokenKind::RParen, "expected ')' after for-loop clauses");
        let body_start = self.cur_builder().here();
        self.patch_jump(inc_skip, body_start);

        *self.loop_depth_stack.last_mut().unwrap() += 1;
        self.statement(vm);
        let to_inc_line = self.current.line;
        let to_inc_ip = self.cur_builder().here();
        let offset = inc_start as i32 - (to_inc_ip as i32 + 1);
        self.emit(Insn::asbx(Op::Jump, 0, offset), to_inc_line);
        let end = self.cur_builder().here();
        if let (Some(ip), Some(r)) = (jump_out, cond_reg) {
            self.patch_jump_if_not(ip, r, end);
        }
        self.cur_builder().patch_breaks_in_range(body_start, end, end);
        *self.loop_depth_stack.last_mut().unwrap() -= 1;
        self.cur_builder().pop_scope();
    }

    fn break_stmt(&mut self) {
        let line = self.current.line;
        self.advance(); // `break`
        if *self.loop_depth_stack.last().unwrap_or(&0) == 0 {
            self.error(line, "'break' outside of a loop");
        }
        self.cur_builder().emit_placeholder(line);
        self.expect(TokenKind::Semicolon, "expected ';' after 'break'");
    }

    fn return_stmt(&mut self, vm: &mut Vm) {
        let line = self.current.line;
        self.advance(); // `return`
        if self.match_tok(TokenKind::Semicolon) {
            self.emit(Insn::abx(Op::Return, 0, 0), line);
            return;
        }
        let mark = self.cur_builder().locals_len() as u16;
        let info = self.expression(vm);
        self.expect(TokenKind::Semicolon, "expected ';' after return value");
        if info.reg != 0 {
            self.emit(Insn::abx(Op::StoreMove, 0, info.reg as u32), line);
        }
        self.cur_builder().pop_temp(mark as usize);
        self.emit(Insn::abx(Op::Return, 0, 0), line);
    }

    fn block_stmt(&mut self, vm: &mut Vm) {
        self.expect(TokenKind::LBrace, "expected '{'");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.statement(vm);
        }
        self.expect(TokenKind::RBrace, "expected '}' to close block");
    }

    fn expr_stmt(&mut self, vm: &mut Vm) {
        let mark = self.cur_builder().locals_len() as u16;
        self.expression(vm);
        self.expect(TokenKind::Semicolon, "expected ';' after expression");
        self.cur_builder().pop_temp(mark as usize);
    }

    // --- expressions ----------------------------------------------------------

    fn expression(&mut self, vm: &mut Vm) -> ExprInfo {
        self.parse_precedence(vm, PREC_ASSIGN)
    }

    fn infix_precedence(&self, kind: TokenKind) -> u8 {
        match kind {
            TokenKind::Eq | TokenKind::PlusEq | TokenKind::MinusEq => PREC_ASSIGN,
            TokenKind::PipePipe => PREC_OR,
            TokenKind::AmpAmp => PREC_AND,
            TokenKind::EqEq | TokenKind::BangEq => PREC_EQUALITY,
            TokenKind::Lt | TokenKind::LtEq | TokenKind::Gt | TokenKind::GtEq => PREC_COMPARISON,
            TokenKind::Plus | TokenKind::Minus => PREC_TERM,
            TokenKind::Star | TokenKind::Slash => PREC_FACTOR,
            TokenKind::Dot | TokenKind::LParen | TokenKind::LBracket | TokenKind::Colon => {
                PREC_CALL
            }
            _ => PREC_NONE,
        }
    }

    fn parse_precedence(&mut self, vm: &mut Vm, min_prec: u8) -> ExprInfo {
        let mut left = self.parse_prefix(vm);
        loop {
            let prec = self.infix_precedence(self.current.kind);
            if prec < min_prec || prec == PREC_NONE {
                break;
            }
            left = self.parse_infix(vm, left, prec);
        }
        left
    }

    fn parse_prefix(&mut self, vm: &mut Vm) -> ExprInfo {
        let line = self.current.line;
        if self.check(TokenKind::Number) {
            self.number_literal(line)
        } else if self.check(TokenKind::StringLit) {
            self.string_literal(line)
        } else if self.match_kw(Keyword::True) {
            self.bool_literal(true, line)
        } else if self.match_kw(Keyword::False) {
            self.bool_literal(false, line)
        } else if self.check_kw(Keyword::Null) {
            self.null_literal(line)
        } else if self.match_kw(Keyword::New) {
            self.new_expr(vm, line)
        } else if self.check_kw(Keyword::Func) {
            self.advance();
            self.func_expr(vm, line)
        } else if self.match_tok(TokenKind::Bang) {
            self.unary_not(vm, line)
        } else if self.match_tok(TokenKind::Minus) {
            self.unary_neg(vm, line)
        } else if self.match_tok(TokenKind::LParen) {
            let inner = self.expression(vm);
            self.expect(TokenKind::RParen, "expected ')' after expression");
            inner
        } else if self.check(TokenKind::Identifier) {
            let name = self.current.lexeme.to_string();
            self.advance();
            self.resolve_name_load(vm, &name, line)
        } else {
            self.error(line, "expected an expression");
            self.null_literal(line)
        }
    }

    fn parse_infix(&mut self, vm: &mut Vm, left: ExprInfo, prec: u8) -> ExprInfo {
        let line = self.current.line;
        match self.current.kind {
            TokenKind::Eq => {
                self.advance();
                self.assign(vm, left, line)
            }
            TokenKind::PlusEq => {
                self.advance();
                self.compound_assign(vm, left, line, Op::MathAdd)
            }
            TokenKind::MinusEq => {
                self.advance();
                self.compound_assign(vm, left, line, Op::MathSub)
            }
            TokenKind::PipePipe => {
                self.advance();
                self.binary(vm, left, line, Op::CmpOr, prec + 1)
            }
            TokenKind::AmpAmp => {
                self.advance();
                self.binary(vm, left, line, Op::CmpAnd, prec + 1)
            }
            TokenKind::EqEq => {
                self.advance();
                self.binary(vm, left, line, Op::CmpEe, prec + 1)
            }
            TokenKind::BangEq => {
                self.advance();
                self.binary(vm, left, line, Op::CmpNe, prec + 1)
            }
            TokenKind::Lt => {
                self.advance();
                self.binary(vm, left, line, Op::CmpLt, prec + 1)
            }
            TokenKind::LtEq => {
                self.advance();
                self.binary(vm, left, line, Op::CmpLe, prec + 1)
            }
            TokenKind::Gt => {
                self.advance();
                self.binary(vm, left, line, Op::CmpGt, prec + 1)
            }
            TokenKind::GtEq => {
                self.advance();
                self.binary(vm, left, line, Op::CmpGe, prec + 1)
            }
            TokenKind::Plus => {
                self.advance();
                self.binary(vm, left, line, Op::MathAdd, prec + 1)
            }
            TokenKind::Minus => {
                self.advance();
                self.binary(vm, left, line, Op::MathSub, prec + 1)
            }
            TokenKind::Star => {
                self.advance();
                self.binary(vm, left, line, Op::MathMul, prec + 1)
            }
            TokenKind::Slash => {
                self.advance();
                self.binary(vm, left, line, Op::MathDiv, prec + 1)
            }
            TokenKind::Dot => {
                self.advance();
                self.dot_access(vm, left, line)
            }
            TokenKind::Colon => {
                self.advance();
                self.method_call(vm, left, line)
            }
            TokenKind::LParen => self.call_expr(vm, left, line),
            TokenKind::LBracket => self.index_expr(vm, left, line),
            _ => left,
        }
    }

    /// Emits `left OP rhs` into a fresh register. Both operands are
    /// always evaluated eagerly, including for `&&`/`||` - the
    /// interpreter's `CMP_AND`/`CMP_OR` are plain boolean-combine
    /// opcodes with no short-circuit behaviour to preserve.
    fn binary(&mut self, vm: &mut Vm, left: ExprInfo, line: i32, op: Op, rhs_prec: u8) -> ExprInfo {
        let right = self.parse_precedence(vm, rhs_prec);
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abc(op, dest, left.reg, right.reg), line);
        ExprInfo::value(dest)
    }

    fn assign(&mut self, vm: &mut Vm, left: ExprInfo, line: i32) -> ExprInfo {
        let rhs = self.parse_precedence(vm, PREC_ASSIGN);
        self.store_to_place(vm, left.place, rhs.reg, line);
        ExprInfo::value(rhs.reg)
    }

    fn compound_assign(&mut self, vm: &mut Vm, left: ExprInfo, line: i32, op: Op) -> ExprInfo {
        let rhs = self.parse_precedence(vm, PREC_ASSIGN);
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abc(op, dest, left.reg, rhs.reg), line);
        self.store_to_place(vm, left.place, dest, line);
        ExprInfo::value(dest)
    }

    /// Writes `value_reg` through `place`. `Place::Index` is handled by
    /// calling the object's `[]=` method rather than a symbol store.
    fn store_to_place(&mut self, vm: &mut Vm, place: Place, value_reg: u16, line: i32) {
        match place {
            Place::Local(reg) => {
                if reg != value_reg {
                    self.emit(Insn::abx(Op::StoreMove, reg, value_reg as u32), line);
                }
            }
            Place::Global(sym) => {
                let mod_reg = self.cur_builder().push_temp(1) as u16;
                self.emit(
                    Insn::abx(Op::LoadBasic, mod_reg, LOAD_BASIC_CURRENT_MODULE),
                    line,
                );
                self.emit(
                    Insn::abc(Op::StoreSymbol, mod_reg, sym.0 as u16, value_reg),
                    line,
                );
                self.cur_builder().pop_temp(mod_reg as usize);
            }
            Place::Field { container, symbol } => {
                self.emit(
                    Insn::abc(Op::StoreSymbol, container, symbol.0 as u16, value_reg),
                    line,
                );
            }
            Place::Index { container, index } => {
                let set_sym = self.intern(vm, "[]=");
                let arg_start = self.cur_builder().push_temp(1) as u16;
                self.emit(Insn::abx(Op::StoreMove, arg_start, container as u32), line);
                let idx_slot = self.cur_builder().push_temp(1) as u16;
                self.emit(Insn::abx(Op::StoreMove, idx_slot, index as u32), line);
                let val_slot = self.cur_builder().push_temp(1) as u16;
                self.emit(Insn::abx(Op::StoreMove, val_slot, value_reg as u32), line);
                let fn_reg = self.cur_builder().push_temp(1) as u16;
                self.emit(
                    Insn::abc(Op::LoadSymbol, fn_reg, arg_start, set_sym.0 as u16),
                    line,
                );
                self.emit(Insn::abc(Op::CallFn, arg_start, fn_reg, 3), line);
                self.cur_builder().pop_temp(arg_start as usize + 1);
            }
            Place::None => {}
        }
    }

    fn resolve_name_load(&mut self, vm: &mut Vm, name: &str, line: i32) -> ExprInfo {
        if let Some(local) = self.cur_builder().lookup(name) {
            return ExprInfo {
                reg: local as u16,
                place: Place::Local(local as u16),
            };
        }
        let sym = self.intern(vm, name);
        let mod_reg = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abx(Op::LoadBasic, mod_reg, LOAD_BASIC_CURRENT_MODULE),
            line,
        );
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abc(Op::LoadSymbol, dest, mod_reg, sym.0 as u16), line);
        ExprInfo {
            reg: dest,
            place: Place::Global(sym),
        }
    }

    fn number_literal(&mut self, line: i32) -> ExprInfo {
        let n = self.current.number;
        self.advance();
        let idx = self.cur_builder().add_constant(ConstLit::Num(n));
        self.load_const(idx, line)
    }

    fn string_literal(&mut self, line: i32) -> ExprInfo {
        let raw = self.current.lexeme;
        let unescaped = crate::object::unescape(raw);
        self.advance();
        let idx = self.cur_builder().add_constant(ConstLit::Str(unescaped));
        self.load_const(idx, line)
    }

    fn bool_literal(&mut self, b: bool, line: i32) -> ExprInfo {
        let dest = self.cur_builder().push_temp(1) as u16;
        let sel = if b { LOAD_BASIC_TRUE } else { LOAD_BASIC_FALSE };
        self.emit(Insn::abx(Op::LoadBasic, dest, sel), line);
        ExprInfo::value(dest)
    }

    fn null_literal(&mut self, line: i32) -> ExprInfo {
        if self.check_kw(Keyword::Null) {
            self.advance();
        }
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abx(Op::LoadBasic, dest, LOAD_BASIC_NULL), line);
        ExprInfo::value(dest)
    }

    fn load_const(&mut self, idx: u32, line: i32) -> ExprInfo {
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abx(Op::LoadBasic, dest, LOAD_BASIC_CONST_OFFSET + idx),
            line,
        );
        ExprInfo::value(dest)
    }

    fn unary_not(&mut self, vm: &mut Vm, line: i32) -> ExprInfo {
        let operand = self.parse_precedence(vm, PREC_UNARY);
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abc(Op::Not, dest, operand.reg, 0), line);
        ExprInfo::value(dest)
    }

    /// There is no dedicated negate opcode; `-x` is emitted as `0 - x`.
    fn unary_neg(&mut self, vm: &mut Vm, line: i32) -> ExprInfo {
        let zero_idx = self.cur_builder().add_constant(ConstLit::Num(0.0));
        let zero = self.load_const(zero_idx, line);
        let operand = self.parse_precedence(vm, PREC_UNARY);
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abc(Op::MathSub, dest, zero.reg, operand.reg), line);
        ExprInfo::value(dest)
    }

    fn dot_access(&mut self, vm: &mut Vm, lhs: ExprInfo, line: i32) -> ExprInfo {
        let name = self.expect_identifier("expected field name after '.'");
        let sym = self.intern(vm, &name);
        let dest = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abc(Op::LoadSymbol, dest, lhs.reg, sym.0 as u16), line);
        ExprInfo {
            reg: dest,
            place: Place::Field {
                container: lhs.reg,
                symbol: sym,
            },
        }
    }

    /// `obj:methodName(args)` - always exactly a method dispatch
    /// followed by a call, never a bare reference to the method.
    fn method_call(&mut self, vm: &mut Vm, lhs: ExprInfo, line: i32) -> ExprInfo {
        let name = self.expect_identifier("expected method name after ':'");
        let sym = self.intern(vm, &name);
        let arg_start = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abx(Op::StoreMove, arg_start, lhs.reg as u32), line);
        let mut num_args = 1u16;
        self.expect(TokenKind::LParen, "expected '(' after method name");
        if !self.check(TokenKind::RParen) {
            loop {
                let line = self.current.line;
                let slot = self.cur_builder().push_temp(1) as u16;
                self.parse_call_arg_into(vm, slot);
                num_args += 1;
                let _ = line;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after arguments");
        let fn_reg = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abc(Op::LoadSymbol, fn_reg, arg_start, sym.0 as u16),
            line,
        );
        self.emit(Insn::abc(Op::CallFn, arg_start, fn_reg, num_args), line);
        self.cur_builder().pop_temp(arg_start as usize + 1);
        ExprInfo::value(arg_start)
    }

    /// Parses one call argument expression and copies its value into
    /// `slot`, collapsing whatever extra temps evaluating it needed.
    fn parse_call_arg_into(&mut self, vm: &mut Vm, slot: u16) {
        let info = self.expression(vm);
        if info.reg != slot {
            let line = self.current.line;
            self.emit(Insn::abx(Op::StoreMove, slot, info.reg as u32), line);
        }
        self.cur_builder().pop_temp(slot as usize + 1);
    }

    /// A plain call's arg block holds only the real arguments - unlike
    /// `method_call`, there's no receiver to seed it with, so the
    /// function being called stays in its own register (`fn_reg`) rather
    /// than sharing `arg_start`.
    fn call_expr(&mut self, vm: &mut Vm, lhs: ExprInfo, line: i32) -> ExprInfo {
        self.advance(); // `(`
        let fn_reg = lhs.reg;
        let arg_start = self.cur_builder().push_temp(1) as u16;
        let mut num_args = 0u16;
        if !self.check(TokenKind::RParen) {
            loop {
                let slot = if num_args == 0 {
                    arg_start
                } else {
                    self.cur_builder().push_temp(1) as u16
                };
                self.parse_call_arg_into(vm, slot);
                num_args += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after arguments");
        self.emit(Insn::abc(Op::CallFn, arg_start, fn_reg, num_args), line);
        self.cur_builder().pop_temp(arg_start as usize + 1);
        ExprInfo::value(arg_start)
    }

    /// `obj[idx]` dispatches through the `[]` method when read; when
    /// immediately followed by `= value` the whole thing is instead
    /// returned as a `Place::Index` for `assign`/`compound_assign` to
    /// write back through `[]=`.
    fn index_expr(&mut self, vm: &mut Vm, lhs: ExprInfo, line: i32) -> ExprInfo {
        self.advance(); // `[`
        let idx_info = self.expression(vm);
        self.expect(TokenKind::RBracket, "expected ']' after index");

        if self.check(TokenKind::Eq) {
            return ExprInfo {
                reg: idx_info.reg,
                place: Place::Index {
                    container: lhs.reg,
                    index: idx_info.reg,
                },
            };
        }

        let get_sym = self.intern(vm, "[]");
        let arg_start = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abx(Op::StoreMove, arg_start, lhs.reg as u32), line);
        let idx_slot = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abx(Op::StoreMove, idx_slot, idx_info.reg as u32), line);
        let fn_reg = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abc(Op::LoadSymbol, fn_reg, arg_start, get_sym.0 as u16),
            line,
        );
        self.emit(Insn::abc(Op::CallFn, arg_start, fn_reg, 2), line);
        self.cur_builder().pop_temp(arg_start as usize + 1);
        ExprInfo::value(arg_start)
    }

    fn new_expr(&mut self, vm: &mut Vm, line: i32) -> ExprInfo {
        let class_name = self.expect_identifier("expected class name after 'new'");
        let class_idx = match self.classes_by_name.get(&class_name) {
            Some(idx) => *idx,
            None => {
                self.error(line, format!("unknown class '{}'", class_name));
                self.module
            }
        };
        let ctor_name = if self.match_tok(TokenKind::Dot) {
            self.expect_identifier("expected constructor name after '.'")
        } else {
            "ctor".to_string()
        };

        let const_idx = self
            .cur_builder()
            .add_constant(ConstLit::Obj(Value::from_ptr(class_idx)));
        let class_reg = self.cur_builder().push_temp(1) as u16;
        self.emit(
            Insn::abx(Op::LoadBasic, class_reg, LOAD_BASIC_CONST_OFFSET + const_idx),
            line,
        );
        let inst_reg = self.cur_builder().push_temp(1) as u16;
        self.emit(Insn::abx(Op::NewClz, inst_reg, class_reg as u32), line);
        self.cur_builder().pop_temp(inst_reg as usize + 1);

        if self.check(TokenKind::LParen) {
            self.advance();
            let ctor_sym = self.intern(vm, &ctor_name);
            let arg_start = self.cur_builder().push_temp(1) as u16;
            self.emit(Insn::abx(Op::StoreMove, arg_start, inst_reg as u32), line);
            let mut num_args = 1u16;
            if !self.check(TokenKind::RParen) {
                loop {
                    let slot = self.cur_builder().push_temp(1) as u16;
                    self.parse_call_arg_into(vm, slot);
                    num_args += 1;
                    if !self.match_tok(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen, "expected ')' after constructor arguments");
            let fn_reg = self.cur_builder().push_temp(1) as u16;
            self.emit(
                Insn::abc(Op::LoadSymbol, fn_reg, arg_start, ctor_sym.0 as u16),
                line,
            );
            self.emit(Insn::abc(Op::CallFn, arg_start, fn_reg, num_args), line);
            self.cur_builder().pop_temp(inst_reg as usize + 1);
        }
        ExprInfo::value(inst_reg)
    }

    fn func_expr(&mut self, vm: &mut Vm, line: i32) -> ExprInfo {
        let params = self.parse_param_list();
        let fn_idx = self.compile_function_body(vm, None, &params, Receiver::None);
        let const_idx = self
            .cur_builder()
            .add_constant(ConstLit::Obj(Value::from_ptr(fn_idx)));
        self.load_const(const_idx, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::vm::Vm;

    fn run(src: &str) -> Vm {
        let mut vm = Vm::new();
        vm.exec_in_module("test", src).expect("module should compile and run");
        vm
    }

    #[test]
    fn reads_module_global_from_nested_function() {
        let mut vm = run("var a = 1 + 2; func get() { return a; }");
        let result = vm.call_named("test", "get", &[]).unwrap();
        assert_eq!(result.as_num(), 3.0);
    }

    #[test]
    fn recursive_fibonacci() {
        let mut vm = run("func fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }");
        let result = vm
            .call_named("test", "fib", &[Value::from_num(10.0)])
            .unwrap();
        assert_eq!(result.as_num(), 55.0);
    }

    #[test]
    fn class_constructor_sets_field() {
        let mut vm = run(
            "class C { var x = 0; func ctor(v) { self.x = v; } } \
             var c = new C.ctor(5); \
             func get() { return c.x; }",
        );
        let result = vm.call_named("test", "get", &[]).unwrap();
        assert_eq!(result.as_num(), 5.0);
    }

    #[test]
    fn import_binds_exported_value() {
        fn lookup(_vm: &mut Vm, _importer: &str, imported: &str) -> Option<String> {
            if imported == "m" {
                Some("static var k = 5; func f(x) { return x * k; }".to_string())
            } else {
                None
            }
        }
        let mut vm = Vm::new();
        vm.on_module_lookup = Some(lookup);
        vm.exec_in_module("test", "import \"m\" for f; var y = f(3); func gety() { return y; }")
            .expect("module should compile and run");
        let result = vm.call_named("test", "gety", &[]).unwrap();
        assert_eq!(result.as_num(), 15.0);
    }

    #[test]
    fn while_loop_with_break() {
        let mut vm = run(
            "func count() { \
                var i = 0; var n = 0; \
                while (i < 5) { \
                    i = i + 1; \
                    if (i == 3) { break; } \
                    n = n + 1; \
                } \
                return n; \
            }",
        );
        let result = vm.call_named("test", "count", &[]).unwrap();
        assert_eq!(result.as_num(), 2.0);
    }

    #[test]
    fn for_loop_sums_range() {
        let mut vm = run(
            "func sum() { \
                var total = 0; \
                for (var i = 0; i < 5; i = i + 1) { total = total + i; } \
                return total; \
            }",
        );
        let result = vm.call_named("test", "sum", &[]).unwrap();
        assert_eq!(result.as_num(), 10.0);
    }
}
