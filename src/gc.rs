use std::time::{Duration, Instant};

use crate::{Chunk, Value, ValueType, VM};

/// Bookkeeping for the collector, readable through [`VM::gc_stats`].
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// How many collections have run.
    pub collections: u64,
    /// Approximate bytes released across all collections.
    pub bytes_freed: u64,
    /// Total wall-clock time spent collecting.
    pub total_gc_time: Duration,
}

impl VM {
    /// Run a full mark-sweep collection over the four heap tables.
    ///
    /// Roots are every value on the stack, every global (both indices, the
    /// by-id key strings included) and every constant of `chunk` and its
    /// nested function chunks, recursively; the program chunk is passed so
    /// string-literal constants survive even when no live value holds
    /// them. Marking is transitive through arrays (elements) and tables
    /// (keys and values), so cycles across the tables are collected
    /// correctly once unreachable. The VM triggers this automatically
    /// after a megabyte of buffer allocation; embedders may also call it
    /// directly.
    pub fn collect_garbage(&mut self, chunk: &Chunk) {
        let started = Instant::now();

        self.heap.strings.clear_marks();
        self.heap.buffers.clear_marks();
        self.heap.arrays.clear_marks();
        self.heap.tables.clear_marks();

        let mut work: Vec<Value> = Vec::with_capacity(64);
        work.extend_from_slice(self.stack());
        work.extend(self.globals.values().copied());
        for (&id, &value) in &self.globals_by_id {
            self.heap.strings.mark(id);
            work.push(value);
        }
        push_constants(chunk, &mut work);

        while let Some(value) = work.pop() {
            match value.kind() {
                ValueType::Str => {
                    self.heap.strings.mark(value.as_handle());
                }
                ValueType::Buffer => {
                    self.heap.buffers.mark(value.as_handle());
                }
                ValueType::Array => {
                    let id = value.as_handle();
                    // first visit only, or cycles would spin forever
                    if self.heap.arrays.mark(id) {
                        work.extend_from_slice(self.heap.arrays.items(id));
                    }
                }
                ValueType::Table => {
                    let id = value.as_handle();
                    if self.heap.tables.mark(id) {
                        for key in self.heap.tables.keys(id) {
                            self.heap.strings.mark(key);
                        }
                        self.heap.tables.for_each(id, |_, v| work.push(v));
                    }
                }
                _ => {}
            }
        }

        let freed = self.heap.strings.sweep()
            + self.heap.buffers.sweep()
            + self.heap.arrays.sweep()
            + self.heap.tables.sweep();

        self.gc_stats.collections += 1;
        self.gc_stats.bytes_freed += freed as u64;
        self.gc_stats.total_gc_time += started.elapsed();
        self.bytes_allocated_since_gc = 0;
    }
}

fn push_constants(chunk: &Chunk, work: &mut Vec<Value>) {
    work.extend_from_slice(chunk.constants());
    for function in chunk.functions() {
        push_constants(&function.chunk, work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile, TableHost};
    use std::io;

    fn quiet_vm() -> VM {
        VM::with_output(Box::new(io::sink()))
    }

    #[test]
    fn unreachable_objects_are_swept_and_roots_survive() {
        let mut vm = quiet_vm();
        let keep = vm.heap_mut().strings.intern("keep");
        vm.set_global("k", Value::string(keep));
        let doomed = vm.heap_mut().buffers.create_from_two("to", "die");

        vm.collect_garbage(&Chunk::default());

        assert_eq!(vm.heap().strings.get(keep), "keep");
        // the buffer slot went back on the free list
        let reused = vm.heap_mut().buffers.create_from_two("x", "y");
        assert_eq!(reused, doomed);
        assert_eq!(vm.gc_stats().collections, 1);
        assert!(vm.gc_stats().bytes_freed >= "todie".len() as u64);
    }

    #[test]
    fn marking_walks_arrays_and_tables_transitively() {
        let mut vm = quiet_vm();
        let inner = vm.heap_mut().strings.intern("inner");
        let arr = vm.heap_mut().arrays.create(0);
        vm.heap_mut().arrays.push_back(arr, Value::string(inner));
        let tbl = vm.heap_mut().tables.create();
        let key = vm.heap_mut().strings.intern("items");
        vm.heap_mut().tables.set(tbl, key, Value::array(arr));
        vm.set_global("root", Value::table(tbl));

        vm.collect_garbage(&Chunk::default());

        assert_eq!(vm.heap().arrays.length(arr), 1);
        assert_eq!(vm.heap().strings.get(inner), "inner");
        assert_eq!(vm.heap().strings.get(key), "items");
    }

    #[test]
    fn cycles_across_tables_collect_once_unreachable() {
        let mut vm = quiet_vm();
        let tbl = vm.heap_mut().tables.create();
        let arr = vm.heap_mut().arrays.create(0);
        let key = vm.heap_mut().strings.intern("back");
        vm.heap_mut().tables.set(tbl, key, Value::array(arr));
        vm.heap_mut().arrays.push_back(arr, Value::table(tbl));
        vm.set_global("cycle", Value::table(tbl));

        // rooted: the cycle survives
        vm.collect_garbage(&Chunk::default());
        assert_eq!(vm.heap().tables.size(tbl), 1);
        assert_eq!(vm.heap().arrays.length(arr), 1);

        // unrooted: both sides of the cycle are released
        vm.globals.remove("cycle");
        vm.globals_by_id.clear();
        vm.collect_garbage(&Chunk::default());
        assert_eq!(vm.heap_mut().tables.create(), tbl);
        assert_eq!(vm.heap_mut().arrays.create(0), arr);
    }

    #[test]
    fn chunk_constants_root_string_literals() {
        let mut vm = quiet_vm();
        let chunk = compile("x = \"literal\"\n", &mut vm.heap_mut().strings).unwrap();
        // never executed: the literal lives only in the constant pool
        vm.collect_garbage(&chunk);
        assert_ne!(
            vm.heap().strings.find_id("literal"),
            crate::STRING_NOT_FOUND
        );
    }

    #[test]
    fn nested_function_constants_are_rooted_too() {
        let mut vm = quiet_vm();
        let src = "function f()\nreturn \"inside\"\nend\n";
        let chunk = compile(src, &mut vm.heap_mut().strings).unwrap();
        vm.collect_garbage(&chunk);
        assert_ne!(vm.heap().strings.find_id("inside"), crate::STRING_NOT_FOUND);
    }

    #[test]
    fn allocation_pressure_triggers_collection_mid_run() {
        let mut vm = quiet_vm();
        // each iteration allocates a fresh ~1 KiB buffer and drops the
        // previous one; 1100 rounds cross the 1 MiB threshold
        let big = "a".repeat(1000);
        let src = format!(
            "i = 0\nwhile i < 1100 do\ns = \"{}\" + \"b\"\ni = i + 1\nend\n",
            big
        );
        let chunk = compile(&src, &mut vm.heap_mut().strings).unwrap();
        vm.execute(&chunk, &mut TableHost::new()).unwrap();

        assert!(vm.gc_stats().collections >= 1);
        assert!(vm.gc_stats().bytes_freed > 0);
        // the live value survived every collection
        let s = vm.get_global("s");
        assert_eq!(vm.stringify(s), format!("{}b", big));
    }
}
