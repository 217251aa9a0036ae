//! Class and method metadata for loaded programs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(all(target_arch = "x86_64", feature = "jit"))]
use crate::jit::JitSlot;

use super::ops::Instr;
use super::ops::ReturnKind;

/// A method body plus the metadata the interpreter and JIT need.
pub struct Method {
    pub id: u32,
    pub class_id: u32,
    pub name: String,
    /// Operand stack slots consumed on entry by the leading parameter stores.
    pub params: u32,
    pub rtrn: ReturnKind,
    pub instrs: Vec<Instr>,
    /// Label id -> instruction index.
    labels: HashMap<u32, usize>,
    /// Local slots the interpreter needs (highest local id + width).
    local_slots: usize,
    call_count: AtomicU32,
    #[cfg(all(target_arch = "x86_64", feature = "jit"))]
    pub(crate) jit: JitSlot,
}

impl Method {
    pub fn new(
        id: u32,
        class_id: u32,
        name: impl Into<String>,
        params: u32,
        rtrn: ReturnKind,
        instrs: Vec<Instr>,
    ) -> Self {
        let mut labels = HashMap::new();
        let mut local_slots = 0usize;
        for (index, instr) in instrs.iter().enumerate() {
            if let Instr::Lbl(label) = instr {
                labels.insert(*label, index);
            }
            if let Some((local, kind)) = instr.local_access() {
                local_slots = local_slots.max((local + kind.slots()) as usize);
            }
        }

        Self {
            id,
            class_id,
            name: name.into(),
            params,
            rtrn,
            instrs,
            labels,
            local_slots,
            call_count: AtomicU32::new(0),
            #[cfg(all(target_arch = "x86_64", feature = "jit"))]
            jit: JitSlot::default(),
        }
    }

    /// Instruction index of a label.
    pub fn label_index(&self, label: u32) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    pub fn local_slots(&self) -> usize {
        self.local_slots
    }

    /// Bump the invocation counter, returning the new count.
    pub(crate) fn record_call(&self) -> u32 {
        self.call_count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// `Class:method` for diagnostics.
    pub fn qualified_name(&self, program: &Program) -> String {
        match program.class(self.class_id) {
            Some(class) => format!("{}:{}", class.name, self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("class_id", &self.class_id)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("rtrn", &self.rtrn)
            .field("instrs", &self.instrs.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct Class {
    pub id: u32,
    pub name: String,
    pub parent: Option<u32>,
    /// Instance field slots.
    pub fields: u32,
    /// Class (static) field slots.
    pub statics: u32,
    pub methods: Vec<Arc<Method>>,
}

impl Class {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            fields: 0,
            statics: 0,
            methods: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: u32) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_fields(mut self, fields: u32) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_statics(mut self, statics: u32) -> Self {
        self.statics = statics;
        self
    }

    /// Add a method; its `class_id` is set to this class.
    pub fn with_method(mut self, mut method: Method) -> Self {
        method.class_id = self.id;
        self.methods.push(Arc::new(method));
        self
    }

    pub fn method(&self, id: u32) -> Option<&Arc<Method>> {
        self.methods.iter().find(|m| m.id == id)
    }
}

/// A loaded program. Class ids index `classes`.
#[derive(Debug)]
pub struct Program {
    classes: Vec<Class>,
}

impl Program {
    pub fn new(mut classes: Vec<Class>) -> Self {
        classes.sort_by_key(|c| c.id);
        Self { classes }
    }

    pub fn class(&self, id: u32) -> Option<&Class> {
        self.classes
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| &self.classes[i])
    }

    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    pub fn method(&self, class: u32, method: u32) -> Option<&Arc<Method>> {
        self.class(class)?.method(method)
    }

    /// Find a method by `Class:method` name.
    pub fn find_method(&self, class: &str, method: &str) -> Option<&Arc<Method>> {
        self.classes
            .iter()
            .find(|c| c.name == class)?
            .methods
            .iter()
            .find(|m| m.name == method)
    }

    /// Whether `class` is `ancestor` or derives from it.
    pub fn is_a(&self, class: u32, ancestor: u32) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.class(id).and_then(|c| c.parent);
        }
        false
    }

    /// Virtual dispatch: the most derived override of `method` visible from
    /// `receiver_class`, matched by name.
    pub fn resolve_virtual<'a>(
        &'a self,
        receiver_class: u32,
        method: &'a Arc<Method>,
    ) -> &'a Arc<Method> {
        let mut current = Some(receiver_class);
        while let Some(id) = current {
            if id == method.class_id {
                break;
            }
            let Some(class) = self.class(id) else { break };
            if let Some(found) = class.methods.iter().find(|m| m.name == method.name) {
                return found;
            }
            current = class.parent;
        }
        method
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ops::MemoryContext;

    fn method(id: u32, name: &str, instrs: Vec<Instr>) -> Method {
        Method::new(id, 0, name, 0, ReturnKind::Int, instrs)
    }

    #[test]
    fn test_labels_and_locals() {
        let m = method(
            0,
            "f",
            vec![
                Instr::LoadIntLit(1),
                Instr::StorFuncVar { id: 3, ctx: MemoryContext::Local },
                Instr::Lbl(7),
                Instr::Rtrn,
            ],
        );
        assert_eq!(m.label_index(7), Some(2));
        assert_eq!(m.label_index(8), None);
        assert_eq!(m.local_slots(), 5);
    }

    #[test]
    fn test_virtual_resolution() {
        let program = Program::new(vec![
            Class::new(0, "Base").with_method(method(0, "area", vec![Instr::Rtrn])),
            Class::new(1, "Square")
                .with_parent(0)
                .with_method(method(0, "area", vec![Instr::Rtrn])),
            Class::new(2, "Plain").with_parent(0),
        ]);
        let base = program.method(0, 0).unwrap();

        assert_eq!(program.resolve_virtual(1, base).class_id, 1);
        assert_eq!(program.resolve_virtual(2, base).class_id, 0);
        assert!(program.is_a(1, 0));
        assert!(!program.is_a(0, 1));
    }
}
