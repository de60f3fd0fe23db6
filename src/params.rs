//! Statement parameter binding.
use crate::{data::Data, encode::Encode, sql::Statement};

/// Ordered parameter slots of a statement.
///
/// The slot count is fixed at construction. Slot `i` below the positional
/// count binds `$i+1`; the remaining slots bind the named parameters in
/// their statement order. Every slot must be bound (to a value or to an
/// explicit `NULL`) before submission.
///
/// ```
/// use prequel::{Params, sql::Statement};
///
/// let stmt = Statement::new("SELECT $1, :name").unwrap();
/// let mut params = Params::from_statement(&stmt);
/// params.bind(0, &42);
/// params.bind_named("name", &"foo");
/// assert!(params.is_complete());
/// ```
pub struct Params {
    slots: Vec<Slot>,
    positional: usize,
    names: Vec<String>,
}

enum Slot {
    Empty,
    Null,
    Value(Data),
}

impl Params {
    /// Slots sized and named from a preparsed statement.
    pub fn from_statement(statement: &Statement) -> Params {
        let mut names = Vec::with_capacity(statement.named_parameter_count());
        for index in 0..statement.named_parameter_count() {
            names.push(
                statement
                    .parameter_name(statement.positional_parameter_count() + index)
                    .to_string(),
            );
        }
        Self::with_names(statement.positional_parameter_count(), names)
    }

    /// `len` anonymous slots.
    pub fn with_len(len: usize) -> Params {
        Self::with_names(len, Vec::new())
    }

    pub(crate) fn with_names(positional: usize, names: Vec<String>) -> Params {
        let mut slots = Vec::new();
        slots.resize_with(positional + names.len(), || Slot::Empty);
        Self { slots, positional, names }
    }

    /// Returns the slot count.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if there are no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns `true` when every slot is bound.
    pub fn is_complete(&self) -> bool {
        !self.slots.iter().any(|slot| matches!(slot, Slot::Empty))
    }

    /// Bind the slot at `index` to owned data.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, data: Data) -> &mut Self {
        self.slots[index] = Slot::Value(data);
        self
    }

    /// Bind the slot at `index` to SQL `NULL`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set_null(&mut self, index: usize) -> &mut Self {
        self.slots[index] = Slot::Null;
        self
    }

    /// Encode `value` into the slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn bind<E: Encode + ?Sized>(&mut self, index: usize, value: &E) -> &mut Self {
        self.slots[index] = match value.encode() {
            Some(data) => Slot::Value(data),
            None => Slot::Null,
        };
        self
    }

    /// Returns the slot index bound by the named parameter `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| i + self.positional)
    }

    /// Bind the slot of the named parameter `name`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown parameter name.
    pub fn bind_named<E: Encode + ?Sized>(&mut self, name: &str, value: &E) -> &mut Self {
        match self.index_of(name) {
            Some(index) => self.bind(index, value),
            None => panic!("unknown parameter name {name:?}"),
        }
    }

    /// Bind the slot of the named parameter `name` to owned data.
    ///
    /// # Panics
    ///
    /// Panics on an unknown parameter name.
    pub fn set_named(&mut self, name: &str, data: Data) -> &mut Self {
        match self.index_of(name) {
            Some(index) => self.set(index, data),
            None => panic!("unknown parameter name {name:?}"),
        }
    }

    /// Unbind every slot.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::Empty;
        }
    }

    /// Wire values in slot order, or the index of the first unbound slot.
    pub(crate) fn values(&self) -> Result<Vec<Option<&Data>>, usize> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Slot::Empty => Err(index),
                Slot::Null => Ok(None),
                Slot::Value(data) => Ok(Some(data)),
            })
            .collect()
    }
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_list();
        for slot in &self.slots {
            match slot {
                Slot::Empty => dbg.entry(&format_args!("<unbound>")),
                Slot::Null => dbg.entry(&format_args!("NULL")),
                Slot::Value(data) => dbg.entry(data),
            };
        }
        dbg.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slots_from_statement() {
        let stmt = Statement::new("SELECT $2, :a, :b").unwrap();
        let mut params = Params::from_statement(&stmt);
        assert_eq!(params.len(), 4);
        assert!(!params.is_complete());

        params.bind(0, &1).bind(1, &2);
        params.bind_named("a", &"x");
        assert!(!params.is_complete());
        params.bind_named("b", &Option::<i32>::None);
        assert!(params.is_complete());

        let values = params.values().unwrap();
        assert_eq!(values.len(), 4);
        assert!(values[3].is_none()); // NULL
        assert_eq!(values[2].unwrap().as_str(), Some("x"));
    }

    #[test]
    fn first_missing_slot_is_reported() {
        let mut params = Params::with_len(3);
        params.set(1, Data::text("x"));
        assert_eq!(params.values().unwrap_err(), 0);
        params.set(0, Data::text("y"));
        assert_eq!(params.values().unwrap_err(), 2);
        params.set_null(2);
        assert!(params.values().is_ok());
    }
}
