use super::table::Table;
use super::value::{hash_str, Class, Closure, Function, Instance, LoxStr, Obj, Upvalue, Value};
use std::mem;

/// Handle to a heap object. Copying the handle copies a reference; two
/// handles are equal exactly when they name the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

struct Slot {
    marked: bool,
    obj: Obj,
}

/// Object arena, allocator accounting and the tracing collector. Every
/// object the language ever sees lives in a slot here; the VM decides when
/// a collection runs and feeds in the roots, the heap does the rest.
pub struct Heap {
    objects: Vec<Option<Slot>>,
    free: Vec<u32>,
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

const FIRST_GC: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += Self::size_of_obj(&obj);
        let slot = Slot { marked: false, obj };
        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(slot);
                index
            }
            None => {
                self.objects.push(Some(slot));
                (self.objects.len() - 1) as u32
            }
        };
        if cfg!(feature = "gc-log") {
            eprintln!(
                "{index:4} allocate ({} bytes total)",
                self.bytes_allocated
            );
        }
        ObjRef(index)
    }

    /// Returns the canonical object for this character sequence, creating
    /// and pooling it on first sight. Afterwards handle equality is content
    /// equality.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_str(chars);
        let found = self
            .strings
            .find_string(hash, |key| self.str_chars(key) == chars);
        if let Some(key) = found {
            return key;
        }
        let key = self.alloc(Obj::Str(LoxStr {
            chars: chars.to_string(),
            hash,
        }));
        self.strings.set(key, hash, Value::Nil);
        key
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.objects[r.0 as usize].as_ref().unwrap().obj
    }

    fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.objects[r.0 as usize].as_mut().unwrap().obj
    }

    pub fn str_chars(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.chars,
            _ => unreachable!(),
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        match self.get(r) {
            Obj::Str(s) => s.hash,
            _ => unreachable!(),
        }
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!(),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!(),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!(),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => unreachable!(),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    // -- collection ------------------------------------------------------
    //
    // The VM marks the roots through `mark_value`/`mark_object`, then calls
    // `trace_references`, `remove_white_strings` and `sweep` in that order.

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = self.objects[r.0 as usize].as_mut().unwrap();
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
        if cfg!(feature = "gc-log") {
            eprintln!("{:4} mark", r.0);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            for child in self.children_of(r) {
                self.mark_value(child);
            }
        }
    }

    /// Direct references held by one object; marking these blackens it.
    fn children_of(&self, r: ObjRef) -> Vec<Value> {
        match self.get(r) {
            Obj::Str(_) | Obj::Native(_) => Vec::new(),
            Obj::Function(f) => {
                let mut children = f.chunk.constants.clone();
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children
            }
            Obj::Closure(c) => {
                let mut children = vec![Value::Obj(c.function)];
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
                children
            }
            Obj::Upvalue(u) => match u {
                Upvalue::Closed(value) => vec![*value],
                Upvalue::Open(_) => Vec::new(),
            },
            Obj::Class(c) => {
                let mut children = vec![Value::Obj(c.name)];
                for (key, value) in c.methods.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
                children
            }
            Obj::Instance(i) => {
                let mut children = vec![Value::Obj(i.class)];
                for (key, value) in i.fields.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
                children
            }
            Obj::BoundMethod(b) => vec![b.receiver, Value::Obj(b.method)],
        }
    }

    /// The intern pool must not keep strings alive: unmarked keys are
    /// dropped before the sweep frees them.
    pub fn remove_white_strings(&mut self) {
        let Heap {
            strings, objects, ..
        } = self;
        strings.remove_unmarked(|key| objects[key.0 as usize].as_ref().unwrap().marked);
    }

    pub fn sweep(&mut self) {
        for index in 0..self.objects.len() {
            match &mut self.objects[index] {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    let size = Self::size_of_obj(&slot.obj);
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                    if cfg!(feature = "gc-log") {
                        eprintln!("{index:4} free ({size} bytes)");
                    }
                    self.objects[index] = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    /// Payload estimate for the allocation trigger. Containers that grow
    /// after allocation (instance fields, method tables) are sized at their
    /// current footprint, so the counter is approximate by design.
    fn size_of_obj(obj: &Obj) -> usize {
        mem::size_of::<Slot>()
            + match obj {
                Obj::Str(s) => s.chars.capacity(),
                Obj::Function(f) => {
                    f.chunk.code.capacity()
                        + f.chunk.lines.capacity() * mem::size_of::<u32>()
                        + f.chunk.constants.capacity() * mem::size_of::<Value>()
                }
                Obj::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjRef>(),
                Obj::Class(c) => c.methods.byte_size(),
                Obj::Instance(i) => i.fields.byte_size(),
                Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
            }
    }

    #[cfg(test)]
    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_handle() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_chars(a), "hello");
        assert_eq!(heap.str_hash(a), hash_str("hello"));
    }

    #[test]
    fn unmarked_objects_are_swept_and_slots_reused() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let dead = heap.intern("dead");
        assert_eq!(heap.live_objects(), 2);

        heap.mark_object(keep);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.str_chars(keep), "keep");

        // The freed slot is recycled and the pooled entry is really gone:
        // re-interning the dropped contents makes a fresh object.
        let again = heap.intern("dead");
        assert_eq!(again, dead);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn sweep_restores_the_unmarked_state() {
        let mut heap = Heap::new();
        let a = heap.intern("a");
        heap.mark_object(a);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        // A second collection without roots frees it, proving the mark bit
        // was cleared.
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn closures_keep_their_function_and_upvalues_alive() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let function = heap.alloc(Obj::Function(Function::new(Some(name))));
        let upvalue = heap.alloc(Obj::Upvalue(Upvalue::Closed(Value::Number(7.0))));
        let closure = heap.alloc(Obj::Closure(Closure {
            function,
            upvalues: vec![upvalue],
        }));

        heap.mark_object(closure);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_objects(), 4);
        match heap.upvalue(upvalue) {
            Upvalue::Closed(Value::Number(n)) => assert_eq!(*n, 7.0),
            _ => panic!("upvalue should have survived closed"),
        }
    }

    #[test]
    fn bytes_accounting_shrinks_after_sweep() {
        let mut heap = Heap::new();
        heap.intern("some garbage string");
        let before = heap.bytes_allocated();
        assert!(before > 0);
        heap.remove_white_strings();
        heap.sweep();
        assert!(heap.bytes_allocated() < before);
    }
}
