use crate::jvm::code::Bytecode;
use crate::jvm::FieldType;
use crate::util::Width;
use std::collections::HashMap;

/// Local variable visible to a snippet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub slot: usize,
    pub typ: FieldType,
}

/// Variables a snippet can refer to by name
///
/// Parameters are bound as `$0` (the receiver, for instance methods), `$1`, `$2`, ... and the
/// return value as `$_`. Slots for new variables are always taken from the top of the buffer's
/// local variable range, so they never clash with the method's own locals.
#[derive(Debug, Default)]
pub struct Scope {
    variables: HashMap<String, Variable>,
}

impl Scope {
    pub fn new() -> Scope {
        Scope::default()
    }

    /// Bind the parameters of a method to `$0`, `$1`, ...
    ///
    /// The receiver of an instance method is bound as an instance of `this_class`. Returns the
    /// number of local slots the parameters occupy.
    pub fn record_params(
        &mut self,
        this_class: &str,
        params: &[FieldType],
        is_static: bool,
        bytecode: &mut Bytecode,
    ) -> usize {
        let mut slot = 0;
        if !is_static {
            self.bind("$0", slot, FieldType::object(this_class));
            slot += 1;
        }
        for (idx, param) in params.iter().enumerate() {
            self.bind(&format!("${}", idx + 1), slot, param.clone());
            slot += param.width();
        }
        bytecode.reserve_locals(slot);
        slot
    }

    /// Bind `$_` to a fresh slot able to hold the return value
    ///
    /// `void` methods still get a slot (holding `null`) so that snippets can mention `$_`.
    pub fn record_return_type(
        &mut self,
        return_type: Option<&FieldType>,
        bytecode: &mut Bytecode,
    ) -> usize {
        let typ = return_type
            .cloned()
            .unwrap_or_else(|| FieldType::object("java/lang/Object"));
        self.record_variable(&typ, "$_", bytecode)
    }

    /// Bind a name to a fresh slot of the given type
    ///
    /// Rebinding a name shadows the earlier variable.
    pub fn record_variable(&mut self, typ: &FieldType, name: &str, bytecode: &mut Bytecode) -> usize {
        let slot = bytecode.allocate_local(typ.width() as u16);
        self.bind(name, slot, typ.clone());
        slot
    }

    fn bind(&mut self, name: &str, slot: usize, typ: FieldType) {
        log::trace!("Binding '{}' to local {} ({:?})", name, slot, typ);
        self.variables
            .insert(name.to_owned(), Variable { slot, typ });
    }

    pub fn lookup(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }
}
