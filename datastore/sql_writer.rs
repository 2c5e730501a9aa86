use crate::conn::Kind;
use crate::layout;
use anyhow::{bail, Result};
use std::fmt::{self, Write};

/// Helper struct for generating SQL statements.
///
/// sea-query covers the DDL; SELECTs carrying correlated JSON subqueries and
/// the meta-shadow projection are written through this writer, which owns the
/// dialect-specific pieces (parameter syntax, identifier quoting, JSON
/// aggregation functions).
#[derive(Debug)]
pub struct SqlWriter {
    kind: Kind,
    text: String,
}

impl SqlWriter {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            text: String::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Overloaded helper method that calls a `write_*` method depending on the type `T`.
    pub fn write<T: WriteSql + ?Sized>(&mut self, x: &T) {
        x.write_sql(self);
    }

    /// Appends the string verbatim into the SQL statement.
    pub fn write_str(&mut self, x: &str) {
        self.text.push_str(x);
    }

    /// Appends the name as a quoted identifier into the SQL statement.
    pub fn write_name(&mut self, name: &layout::Name) {
        let quote = match self.kind {
            Kind::MySql => '`',
            Kind::Postgres | Kind::Sqlite => '"',
        };
        let name = &name.0;
        self.text.reserve(2 + name.len());
        self.text.push(quote);
        for c in name.chars() {
            if c == quote {
                self.text.push(quote);
                self.text.push(quote);
            } else {
                self.text.push(c);
            }
        }
        self.text.push(quote);
    }

    /// Appends a parameter with given **zero-based** index into the SQL statement.
    ///
    /// This uses the correct syntax depending on the database (`?n` for SQLite, `$n` for
    /// Postgres, bare `?` for MySQL). Note that the `idx` is zero-based, but the SQL parameter
    /// syntax is one-based, so `idx` of 0 produces `?1` (or `$1`).
    ///
    /// MySQL parameters are purely positional, so callers must emit parameters
    /// in the same order they bind them.
    pub fn write_param(&mut self, idx: usize) {
        match self.kind {
            Kind::Sqlite => write!(self, "?{}", idx + 1),
            Kind::Postgres => write!(self, "${}", idx + 1),
            Kind::MySql => self.write_str("?"),
        }
    }

    /// Appends a literal string into the SQL statement.
    pub fn write_literal_str(&mut self, value: &str) -> Result<()> {
        self.text.reserve(2 + value.len());
        self.text.push('\'');
        for c in value.chars() {
            if c == '\'' {
                self.text.push_str("''");
            } else if c == '\0' {
                bail!("cannot insert a NUL byte into a SQL literal string")
            } else {
                self.text.push(c);
            }
        }
        self.text.push('\'');
        Ok(())
    }

    /// Appends a literal float into the SQL statement.
    pub fn write_literal_f64(&mut self, value: f64) -> Result<()> {
        if value.is_finite() {
            write!(self, "{}", value);
        } else if value.is_infinite() {
            match (self.kind, value.is_sign_positive()) {
                // impossibly large values are parsed as infinity in SQLite and MySQL
                (Kind::Sqlite | Kind::MySql, true) => self.write("9e999"),
                (Kind::Sqlite | Kind::MySql, false) => self.write("-9e999"),
                (Kind::Postgres, true) => self.write("CAST('inf' AS double precision)"),
                (Kind::Postgres, false) => self.write("CAST('-inf' AS double precision)"),
            }
        } else {
            bail!("cannot use NaN as a SQL literal")
        }
        Ok(())
    }

    /// Appends a JSON-object constructor over pre-rendered `(key, expr)`
    /// pairs: `json_build_object('k', expr, ...)` on Postgres,
    /// `json_object(...)` on SQLite, `JSON_OBJECT(...)` on MySQL.
    pub fn write_json_object(&mut self, pairs: &[(&str, String)]) -> Result<()> {
        let func = match self.kind {
            Kind::Postgres => "json_build_object",
            Kind::Sqlite => "json_object",
            Kind::MySql => "JSON_OBJECT",
        };
        self.write_str(func);
        self.write_str("(");
        for (i, (key, expr)) in pairs.iter().enumerate() {
            if i > 0 {
                self.write_str(", ");
            }
            self.write_literal_str(key)?;
            self.write_str(", ");
            self.write_str(expr);
        }
        self.write_str(")");
        Ok(())
    }

    /// Appends a JSON-array aggregation of `expr` that yields `[]` instead of
    /// NULL when the aggregated set is empty.
    pub fn write_json_array_agg(&mut self, expr: &str) {
        let func = match self.kind {
            Kind::Postgres => "json_agg",
            Kind::Sqlite => "json_group_array",
            Kind::MySql => "JSON_ARRAYAGG",
        };
        write!(self, "coalesce({func}({expr}), '[]')");
    }

    /// Appends a cast of `expr` to the dialect's text type. JSON columns
    /// travel as text and are parsed back into structured values before
    /// materialization.
    pub fn write_cast_text(&mut self, expr: &str) {
        match self.kind {
            Kind::Postgres => write!(self, "({expr})::text"),
            Kind::Sqlite => write!(self, "CAST({expr} AS TEXT)"),
            Kind::MySql => write!(self, "CAST({expr} AS CHAR)"),
        }
    }

    /// This method makes the `write!` macro work with this struct.
    pub fn write_fmt(&mut self, fmt: fmt::Arguments<'_>) {
        self.text.write_fmt(fmt).expect("formatting failed")
    }

    /// Returns the produced SQL statement.
    pub fn build(self) -> String {
        self.text
    }
}

pub trait WriteSql {
    fn write_sql(&self, writer: &mut SqlWriter);
}

impl WriteSql for str {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_str(self);
    }
}

impl WriteSql for String {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_str(self);
    }
}

impl WriteSql for layout::Name {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_name(self);
    }
}
