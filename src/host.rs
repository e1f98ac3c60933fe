use std::fmt;

use rustc_hash::FxHashMap;

use crate::Value;

/// A callable the host application exposes to scripts. It runs synchronously
/// on the VM's thread, reads its arguments by value and returns one value.
/// To signal an error a callable returns `nil` and writes to the diagnostic
/// stream.
pub type HostFunction = Box<dyn FnMut(&[Value]) -> Value>;

/// The environment the VM calls into for anything the language itself does
/// not provide. `CALL_HOST` consults the host first, then the chunk's own
/// functions.
pub trait HostEnvironment {
    /// Bind a callable to a name. Names are stored lowercased so lookup is
    /// case-insensitive.
    fn register_function(&mut self, name: &str, func: HostFunction);

    /// Invoke a registered callable, or return `None` when the name is not
    /// registered (the VM then falls through to user-function lookup).
    fn call(&mut self, name: &str, args: &[Value]) -> Option<Value>;
}

/// The plain table-backed host environment used by the runner and tests.
/// Embedders with richer dispatch needs implement [`HostEnvironment`]
/// themselves.
#[derive(Default)]
pub struct TableHost {
    functions: FxHashMap<String, HostFunction>,
}

impl TableHost {
    /// An environment with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostEnvironment for TableHost {
    fn register_function(&mut self, name: &str, func: HostFunction) {
        self.functions.insert(name.to_lowercase(), func);
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Option<Value> {
        self.functions.get_mut(name).map(|func| func(args))
    }
}

impl fmt::Debug for TableHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TableHost").field("functions", &names).finish()
    }
}
