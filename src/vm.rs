use super::chunk::OpCode;
use super::compiler::Compiler;
use super::heap::{Heap, ObjRef};
use super::natives;
use super::reporter::{Phase, Report, Reporter};
use super::table::Table;
use super::value::{print_value, BoundMethod, Class, Closure, Instance, NativeFn, Obj, Upvalue, Value};
use std::io::{self, Write};
use thiserror::Error;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error("runtime error")]
    Runtime,
}

/// One call's window into the shared value stack: `slots` is where its
/// slot 0 (the callee, or `this`) lives.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues still aliasing live stack slots, ordered by descending
    /// slot so capture and close both walk from the top of the stack.
    open_upvalues: Vec<ObjRef>,
    heap: Heap,
    init_string: ObjRef,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// A VM whose `print` output goes to the given sink; used by tests and
    /// embedders.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            out,
        };
        for (name, native) in natives::NATIVES {
            vm.define_native(name, native);
        }
        vm
    }

    /// Compiles and runs one unit of source. Globals survive between calls,
    /// which is what keeps a REPL session stateful.
    pub fn interpret(
        &mut self,
        source: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<(), InterpretError> {
        let function = Compiler::new(source, &mut self.heap, reporter)
            .compile()
            .map_err(|_| InterpretError::Compile)?;

        // The fresh function must be rooted before the closure allocation
        // can trigger a collection.
        self.push(Value::Obj(function));
        let closure = self.allocate(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        let result = self
            .call_closure(closure, 0)
            .and_then(|()| self.run());
        result.map_err(|message| {
            self.report_runtime_error(&message, reporter);
            InterpretError::Runtime
        })
    }

    // -- stack and frames ------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        let closure = frame.closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string_constant(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(name) => name,
            _ => unreachable!(),
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // -- allocation ------------------------------------------------------
    //
    // Every allocation the VM makes goes through these two, which is where
    // collections happen. Anything the current instruction still needs must
    // already be reachable from a root before calling them.

    fn allocate(&mut self, obj: Obj) -> ObjRef {
        if cfg!(feature = "gc-stress") || self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    fn intern(&mut self, chars: &str) -> ObjRef {
        if cfg!(feature = "gc-stress") || self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(chars)
    }

    fn collect_garbage(&mut self) {
        if cfg!(feature = "gc-log") {
            eprintln!("-- gc begin");
        }
        let before = self.heap.bytes_allocated();

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();

        if cfg!(feature = "gc-log") {
            eprintln!(
                "-- gc end (collected {} bytes)",
                before.saturating_sub(self.heap.bytes_allocated())
            );
        }
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        // Both objects stay rooted on the stack until the global is set.
        self.push(Value::Obj(name));
        let native = self.allocate(Obj::Native(function));
        self.push(Value::Obj(native));
        let hash = self.heap.str_hash(name);
        self.globals.set(name, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // -- calls -----------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        if let Value::Obj(obj) = callee {
            match self.heap.get(obj) {
                Obj::Closure(_) => return self.call_closure(obj, arg_count),
                Obj::Class(_) => return self.call_class(obj, arg_count),
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    // The receiver takes the callee slot so `this` resolves
                    // as the method's slot 0.
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                Obj::Native(native) => {
                    let native = *native;
                    let argv = self.stack.len() - arg_count;
                    let result = native(&self.stack[argv..]);
                    self.stack.truncate(argv - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), String> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if arg_count != arity {
            return Err(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), String> {
        let slot = self.stack.len() - arg_count - 1;
        let instance = self.allocate(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        self.stack[slot] = Value::Obj(instance);

        let hash = self.heap.str_hash(self.init_string);
        match self.heap.class(class).methods.get(self.init_string, hash) {
            Some(Value::Obj(initializer)) => self.call_closure(initializer, arg_count),
            Some(_) => unreachable!(),
            None if arg_count != 0 => {
                Err(format!("Expected 0 arguments but got {}.", arg_count))
            }
            None => Ok(()),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), String> {
        let hash = self.heap.str_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => Err(format!(
                "Undefined property '{}'.",
                self.heap.str_chars(name)
            )),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), String> {
        let hash = self.heap.str_hash(name);
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => method,
            _ => {
                return Err(format!(
                    "Undefined property '{}'.",
                    self.heap.str_chars(name)
                ))
            }
        };
        let receiver = self.peek(0);
        let bound = self.allocate(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // -- upvalues --------------------------------------------------------

    /// Returns the upvalue aliasing `slot`, creating it if this is the
    /// first capture. Sharing the cell is what makes sibling closures see
    /// each other's writes.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (index, &upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(open_slot) => *open_slot,
                Upvalue::Closed(_) => unreachable!(),
            };
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                insert_at = index;
                break;
            }
        }

        let created = self.allocate(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Moves every open upvalue at or above `last` off the stack and into
    /// its own cell.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => unreachable!(),
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // -- errors ----------------------------------------------------------

    fn report_runtime_error(&mut self, message: &str, reporter: &mut dyn Reporter) {
        let mut text = format!("{}\n", message);
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.lines[frame.ip - 1];
            text += &format!("[line {}] in ", line);
            match function.name {
                Some(name) => text += &format!("{}()\n", self.heap.str_chars(name)),
                None => text += "script\n",
            }
        }
        reporter.error(Report::new(Phase::Runtime, text.trim_end().to_string()));
        self.reset_stack();
    }

    // -- dispatch --------------------------------------------------------

    fn run(&mut self) -> Result<(), String> {
        loop {
            #[cfg(feature = "debug-execution")]
            {
                let mut trace = String::from("          ");
                for &value in &self.stack {
                    trace += &format!("[ {} ]", print_value(&self.heap, value));
                }
                println!("{}", trace);
                let frame = self.frame();
                let function = self.heap.closure(frame.closure).function;
                let chunk = &self.heap.function(function).chunk;
                print!("{}", chunk.disassemble_instruction(&self.heap, frame.ip).0);
            }

            let op = OpCode::try_from(self.read_byte()).unwrap();
            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(format!(
                                "Undefined variable '{}'.",
                                self.heap.str_chars(name)
                            ))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment never brings a global into existence.
                        self.globals.delete(name, hash);
                        return Err(format!(
                            "Undefined variable '{}'.",
                            self.heap.str_chars(name)
                        ));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[*slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let instance = match self.peek(0) {
                        Value::Obj(obj) if matches!(self.heap.get(obj), Obj::Instance(_)) => obj,
                        _ => return Err("Only instances have properties.".to_string()),
                    };
                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let instance = match self.peek(1) {
                        Value::Obj(obj) if matches!(self.heap.get(obj), Obj::Instance(_)) => obj,
                        _ => return Err("Only instances have fields.".to_string()),
                    };
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    // Assignment is an expression: drop the instance, leave
                    // the assigned value.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = match self.pop() {
                        Value::Obj(class) => class,
                        _ => unreachable!(),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Less => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Bool(a < b));
                }
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.heap.get(a), Obj::Str(_))
                            && matches!(self.heap.get(b), Obj::Str(_)) =>
                    {
                        let mut chars = self.heap.str_chars(a).to_string();
                        chars.push_str(self.heap.str_chars(b));
                        // Operands stay on the stack while interning may
                        // collect.
                        let result = self.intern(&chars);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    }
                    _ => return Err("Operands must be two numbers or two strings.".to_string()),
                },
                OpCode::Subtract => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a / b));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err("Operand must be a number.".to_string()),
                },

                OpCode::Print => {
                    let value = self.pop();
                    let text = print_value(&self.heap, value);
                    let _ = writeln!(self.out, "{}", text);
                }

                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let instance = match self.peek(arg_count) {
                        Value::Obj(obj) if matches!(self.heap.get(obj), Obj::Instance(_)) => obj,
                        _ => return Err("Only instances have methods.".to_string()),
                    };
                    let hash = self.heap.str_hash(name);
                    if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
                        // A field shadowing a method is an ordinary call.
                        let slot = self.stack.len() - arg_count - 1;
                        self.stack[slot] = field;
                        self.call_value(field, arg_count)?;
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.invoke_from_class(class, name, arg_count)?;
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(class) => class,
                        _ => unreachable!(),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(function) => function,
                        _ => unreachable!(),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    // The function constant is reachable through the frame
                    // chain, so this allocation is safe; the closure itself
                    // is rooted before its upvalues are captured.
                    let closure = self.allocate(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().slots;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // The script closure is the last thing left.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class = self.allocate(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Obj(obj) if matches!(self.heap.get(obj), Obj::Class(_)) => obj,
                        _ => return Err("Superclass must be a class.".to_string()),
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(class) => class,
                        _ => unreachable!(),
                    };
                    let methods: Vec<(ObjRef, u32, Value)> = self
                        .heap
                        .class(superclass)
                        .methods
                        .iter()
                        .map(|(key, value)| (key, self.heap.str_hash(key), value))
                        .collect();
                    for (key, hash, value) in methods {
                        self.heap.class_mut(subclass).methods.set(key, hash, value);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(class) => class,
                        _ => unreachable!(),
                    };
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    fn pop_numbers(&mut self) -> Result<(f64, f64), String> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err("Operands must be numbers.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

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

    fn run(source: &str) -> (Result<(), InterpretError>, String, Vec<String>) {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut reporter = ErrorCollector::new();
        let result = vm.interpret(source, &mut reporter);
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        (result, output, reporter.errors)
    }

    fn run_ok(source: &str) -> String {
        let (result, output, errors) = run(source);
        assert_eq!(result, Ok(()), "errors: {:?}", errors);
        output
    }

    fn run_runtime_error(source: &str) -> (String, String) {
        let (result, output, errors) = run(source);
        assert_eq!(result, Err(InterpretError::Runtime));
        (output, errors.into_iter().next().unwrap())
    }

    #[test]
    fn arithmetic_and_falsiness() {
        assert_eq!(run_ok("print 1 + 2 * 3; print !nil; print !!0;"), "7\ntrue\ntrue\n");
    }

    #[test]
    fn string_concatenation_interns_the_result() {
        assert_eq!(run_ok("print \"ab\" + \"c\" == \"abc\";"), "true\n");
    }

    #[test]
    fn comparisons_and_equality() {
        assert_eq!(
            run_ok("print 1 < 2; print 2 <= 2; print 3 > 4; print nil == nil; print nil == false;"),
            "true\ntrue\nfalse\ntrue\nfalse\n"
        );
    }

    #[test]
    fn globals_and_locals() {
        assert_eq!(
            run_ok("var a = 1; { var b = 2; a = b + a; } print a;"),
            "3\n"
        );
    }

    #[test]
    fn control_flow() {
        assert_eq!(
            run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
            "0\n1\n2\n"
        );
        assert_eq!(
            run_ok("for (var j = 0; j < 2; j = j + 1) print j;"),
            "0\n1\n"
        );
        assert_eq!(
            run_ok("if (1 > 2) print \"then\"; else print \"else\";"),
            "else\n"
        );
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(
            run_ok("print true and 1; print false and 1; print nil or \"x\"; print 2 or 3;"),
            "1\nfalse\nx\n2\n"
        );
    }

    #[test]
    fn functions_and_returns() {
        assert_eq!(
            run_ok("fun add(a, b) { return a + b; } print add(1, 2); print add;"),
            "3\n<fn add>\n"
        );
    }

    #[test]
    fn closures_retain_by_reference() {
        let source = "\
fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }
var a = makeCounter(); print a(); print a(); print a();";
        assert_eq!(run_ok(source), "1\n2\n3\n");
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let source = "\
fun outer() {
  var x = 1;
  fun set(v) { x = v; }
  fun get() { return x; }
  set(42);
  print get();
}
outer();";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn shared_upvalue_survives_closing() {
        let source = "\
var set; var get;
fun outer() {
  var x = 1;
  fun s(v) { x = v; }
  fun g() { return x; }
  set = s;
  get = g;
}
outer();
set(42);
print get();";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn loop_variable_is_shared_across_iterations() {
        let source = "\
var g;
for (var i = 0; i < 3; i = i + 1) { fun f() { return i; } g = f; }
print g();";
        assert_eq!(run_ok(source), "3\n");
    }

    #[test]
    fn classes_init_inheritance_super() {
        let source = "\
class A { greet() { print \"A\"; } }
class B < A { greet() { super.greet(); print \"B\"; } }
B().greet();";
        assert_eq!(run_ok(source), "A\nB\n");
    }

    #[test]
    fn initializer_receives_arguments_and_returns_this() {
        let source = "\
class Point {
  init(x, y) { this.x = x; this.y = y; }
  sum() { return this.x + this.y; }
}
var p = Point(3, 4);
print p.sum();
print p.init(1, 1).sum();";
        assert_eq!(run_ok(source), "7\n2\n");
    }

    #[test]
    fn fields_holding_closures_win_over_methods() {
        let source = "\
class Box { init(f) { this.get = f; } get() { return \"method\"; } }
fun shadow() { return \"field\"; }
print Box(shadow).get();";
        assert_eq!(run_ok(source), "field\n");
    }

    #[test]
    fn bound_methods_carry_their_receiver() {
        let source = "\
class Greeter {
  init(name) { this.name = name; }
  hello() { print \"hi \" + this.name; }
}
var m = Greeter(\"lox\").hello;
m();";
        assert_eq!(run_ok(source), "hi lox\n");
    }

    #[test]
    fn instances_print_by_class_name() {
        assert_eq!(
            run_ok("class Pair {} print Pair; print Pair();"),
            "Pair\nPair instance\n"
        );
    }

    #[test]
    fn native_clock_is_a_number() {
        assert_eq!(run_ok("print clock() > 0; print clock;"), "true\n<native fn>\n");
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut reporter = ErrorCollector::new();
        assert_eq!(vm.interpret("var a = 40;", &mut reporter), Ok(()));
        assert_eq!(vm.interpret("print a + 2;", &mut reporter), Ok(()));
        assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "42\n");
    }

    #[test]
    fn for_loop_variable_dies_with_the_loop() {
        let (output, error) =
            run_runtime_error("for (var i = 0; i < 3; i = i + 1) print i; print i;");
        assert_eq!(output, "0\n1\n2\n");
        assert!(error.contains("Undefined variable 'i'."));
        assert!(error.contains("[line 1] in script"));
    }

    #[test]
    fn undefined_global_assignment() {
        let (_, error) = run_runtime_error("x = 1;");
        assert!(error.contains("Undefined variable 'x'."));
    }

    #[test]
    fn arity_mismatch() {
        let (_, error) = run_runtime_error("fun f(a) {} f();");
        assert!(error.contains("Expected 1 arguments but got 0."));
    }

    #[test]
    fn calling_a_non_callable() {
        let (_, error) = run_runtime_error("var x = 1; x();");
        assert!(error.contains("Can only call functions and classes."));
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let (_, error) = run_runtime_error("fun f() { f(); } f();");
        assert!(error.starts_with("Stack overflow."));
    }

    #[test]
    fn runtime_error_trace_names_enclosing_functions() {
        let source = "fun inner() { return 1 + nil; }\nfun outer() { inner(); }\nouter();";
        let (_, error) = run_runtime_error(source);
        assert!(error.contains("Operands must be two numbers or two strings."));
        assert!(error.contains("[line 1] in inner()"));
        assert!(error.contains("[line 2] in outer()"));
        assert!(error.contains("[line 3] in script"));
    }

    #[test]
    fn type_errors_for_operators() {
        let (_, error) = run_runtime_error("print -\"a\";");
        assert!(error.contains("Operand must be a number."));
        let (_, error) = run_runtime_error("print 1 < \"a\";");
        assert!(error.contains("Operands must be numbers."));
        let (_, error) = run_runtime_error("print 1 + \"a\";");
        assert!(error.contains("Operands must be two numbers or two strings."));
    }

    #[test]
    fn property_errors() {
        let (_, error) = run_runtime_error("var x = 1; print x.y;");
        assert!(error.contains("Only instances have properties."));
        let (_, error) = run_runtime_error("var x = 1; x.y = 2;");
        assert!(error.contains("Only instances have fields."));
        let (_, error) = run_runtime_error("class A {} print A().missing;");
        assert!(error.contains("Undefined property 'missing'."));
        let (_, error) = run_runtime_error("class A {} A().missing();");
        assert!(error.contains("Undefined property 'missing'."));
    }

    #[test]
    fn superclass_must_be_a_class() {
        let (_, error) = run_runtime_error("var x = 1; class A < x {}");
        assert!(error.contains("Superclass must be a class."));
    }

    #[test]
    fn constructor_argument_checking() {
        let (_, error) = run_runtime_error("class A {} A(1);");
        assert!(error.contains("Expected 0 arguments but got 1."));
    }

    #[test]
    fn vm_recovers_after_a_runtime_error() {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut reporter = ErrorCollector::new();
        assert_eq!(
            vm.interpret("x = 1;", &mut reporter),
            Err(InterpretError::Runtime)
        );
        assert_eq!(vm.interpret("print 2;", &mut reporter), Ok(()));
        assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "2\n");
    }

    #[test]
    fn collection_frees_unreachable_cycles() {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut reporter = ErrorCollector::new();
        let source = "\
class Node { init() { this.next = nil; } }
fun cycle() {
  var a = Node();
  var b = Node();
  a.next = b;
  b.next = a;
}
cycle();";
        assert_eq!(vm.interpret(source, &mut reporter), Ok(()));
        let before = vm.heap.live_objects();
        vm.collect_garbage();
        let after = vm.heap.live_objects();
        assert!(after < before, "cycle should have been collected");

        // Interning and the cached init string survive the collection.
        assert_eq!(vm.interpret("print Node();", &mut reporter), Ok(()));
        assert_eq!(
            String::from_utf8(buf.0.borrow().clone()).unwrap(),
            "Node instance\n"
        );
    }

    #[test]
    fn method_calls_chain_through_invoke() {
        let source = "\
class Counter {
  init() { this.n = 0; }
  bump() { this.n = this.n + 1; return this; }
  value() { return this.n; }
}
print Counter().bump().bump().value();";
        assert_eq!(run_ok(source), "2\n");
    }

    #[test]
    fn super_invoke_dispatches_to_the_superclass() {
        let source = "\
class A { twice(n) { return n * 2; } }
class B < A { twice(n) { return super.twice(n) + 1; } }
print B().twice(10);";
        assert_eq!(run_ok(source), "21\n");
    }
}
