//! The per-connection prepared statement registry entry.
use crate::{params::Params, postgres::Oid, row::Row};

/// The server-side view of a prepared statement.
///
/// Entries live in the owning [`Connection`][crate::Connection] registry,
/// keyed by name (the empty name is the unnamed statement). An entry
/// appears when a `Parse` completes or a statement is described, and is
/// gone after an unprepare or a disconnect.
pub struct PreparedStatement {
    name: String,
    is_preparsed: bool,
    is_described: bool,
    positional: usize,
    parameter_names: Vec<String>,
    parameter_oids: Vec<Oid>,
    row_description: Option<Row>,
}

impl PreparedStatement {
    pub(crate) fn preparsed(name: String, positional: usize, parameter_names: Vec<String>) -> Self {
        Self {
            name,
            is_preparsed: true,
            is_described: false,
            positional,
            parameter_names,
            parameter_oids: Vec::new(),
            row_description: None,
        }
    }

    /// A statement prepared outside of this library, e.g. by the SQL
    /// `PREPARE` command. Nothing is known about it until described.
    pub(crate) fn untracked(name: String) -> Self {
        Self {
            name,
            is_preparsed: false,
            is_described: false,
            positional: 0,
            parameter_names: Vec::new(),
            parameter_oids: Vec::new(),
            row_description: None,
        }
    }

    pub(crate) fn set_parameter_oids(&mut self, oids: Vec<Oid>) {
        self.parameter_oids = oids;
    }

    pub(crate) fn set_described(&mut self, row_description: Option<Row>) {
        self.is_described = true;
        self.row_description = row_description;
    }

    /// Returns the statement name, empty for the unnamed statement.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` when the statement was built from a preparsed
    /// [`Statement`][crate::sql::Statement].
    pub fn is_preparsed(&self) -> bool {
        self.is_preparsed
    }

    /// Returns `true` once the server described the statement.
    pub fn is_described(&self) -> bool {
        self.is_described
    }

    /// Returns the parameter count.
    ///
    /// Before a describe this is the preparsed count, after it is the
    /// server reported count.
    pub fn parameter_count(&self) -> usize {
        match self.is_described {
            true => self.parameter_oids.len(),
            false => self.positional + self.parameter_names.len(),
        }
    }

    /// Returns the parameter type [`Oid`]s reported by a describe.
    pub fn parameter_oids(&self) -> Option<&[Oid]> {
        match self.is_described {
            true => Some(&self.parameter_oids),
            false => None,
        }
    }

    /// Returns the description of the rows the statement produces.
    ///
    /// [`None`] until described, or when the statement produces no rows.
    /// The row carries the column layout with no values.
    pub fn row_description(&self) -> Option<&Row> {
        self.row_description.as_ref()
    }

    /// Fresh unbound parameter slots for this statement.
    ///
    /// Named slots are available when the statement was preparsed.
    pub fn params(&self) -> Params {
        match self.is_preparsed {
            true => Params::with_names(self.positional, self.parameter_names.clone()),
            false => Params::with_len(self.parameter_count()),
        }
    }
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.name)
            .field("is_preparsed", &self.is_preparsed)
            .field("is_described", &self.is_described)
            .field("parameter_count", &self.parameter_count())
            .finish()
    }
}
