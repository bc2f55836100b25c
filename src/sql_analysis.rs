//! Structural placeholder analysis
//!
//! Finds, for each positional `$n` placeholder of a statement, the column it
//! is assigned to or compared with. Only the AST shapes that can own a
//! placeholder are walked; everything else is ignored. No catalog access
//! happens here: the result is a list of candidate tables per placeholder
//! that [`crate::type_resolver::TypeResolver`] checks against the catalog.

use sqlparser::ast::{
    Expr, Ident, JoinConstraint, JoinOperator, ObjectName, Query, SetExpr, Statement, TableFactor,
    TableWithJoins, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;

/// Where in the statement a placeholder was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    /// `UPDATE ... SET col = $n`
    Set,
    /// `WHERE`/`HAVING`/`JOIN ... ON` comparisons
    Where,
    /// `INSERT ... VALUES` position
    Values,
}

/// Which column a placeholder binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Named(String),
    /// INSERT without a column list: n-th column in catalog order
    Position(usize),
}

/// Resolved owner of one placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderBinding {
    /// 1-based placeholder number (`$n`)
    pub index: usize,
    /// Real table names to try, most specific first (lowercase)
    pub tables: Vec<String>,
    pub column: ColumnRef,
    pub clause: Clause,
}

impl PlaceholderBinding {
    /// First candidate table (the only one for qualified references)
    pub fn table(&self) -> Option<&str> {
        self.tables.first().map(String::as_str)
    }

    pub fn column_name(&self) -> Option<&str> {
        match &self.column {
            ColumnRef::Named(c) => Some(c),
            ColumnRef::Position(_) => None,
        }
    }
}

/// Statement kinds the analysis understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    /// Case-insensitive leading keyword check (`WITH` counts as SELECT)
    pub fn detect(sql: &str) -> Option<StatementKind> {
        let head: String = sql
            .trim_start()
            .trim_start_matches('(')
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();
        match head.as_str() {
            "SELECT" | "WITH" => Some(StatementKind::Select),
            "INSERT" => Some(StatementKind::Insert),
            "UPDATE" => Some(StatementKind::Update),
            "DELETE" => Some(StatementKind::Delete),
            _ => None,
        }
    }
}

/// Per-statement analysis state: alias map, tables in scope and results.
///
/// Lives for exactly one statement; nested subqueries push and pop scope.
#[derive(Debug, Default)]
pub struct AnalysisContext {
    aliases: HashMap<String, String>,
    scope: Vec<String>,
    bindings: Vec<PlaceholderBinding>,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a table reference and its alias; returns the real name
    fn register_table(&mut self, name: &ObjectName, alias: Option<&Ident>) -> String {
        let real = object_name(name);
        self.aliases.insert(real.clone(), real.clone());
        if let Some(last) = name.0.last() {
            self.aliases.insert(last.value.to_lowercase(), real.clone());
        }
        if let Some(alias) = alias {
            self.aliases.insert(alias.value.to_lowercase(), real.clone());
        }
        if !self.scope.contains(&real) {
            self.scope.push(real.clone());
        }
        real
    }

    fn resolve_qualifier(&self, qualifier: &str) -> String {
        let key = qualifier.to_lowercase();
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    /// Candidate tables and column name for a column expression
    fn column_of(&self, expr: &Expr) -> Option<(Vec<String>, String)> {
        match expr {
            Expr::Identifier(ident) => Some((self.scope.clone(), ident.value.to_lowercase())),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let column = parts[parts.len() - 1].value.to_lowercase();
                let qualifier: Vec<String> = parts[..parts.len() - 1].iter().map(|p| p.value.clone()).collect();
                Some((vec![self.resolve_qualifier(&qualifier.join("."))], column))
            }
            Expr::Nested(inner) => self.column_of(inner),
            Expr::Cast { expr, .. } => self.column_of(expr),
            _ => None,
        }
    }

    fn bind(&mut self, index: usize, tables: Vec<String>, column: ColumnRef, clause: Clause) {
        if self.bindings.iter().any(|b| b.index == index) {
            return;
        }
        self.bindings.push(PlaceholderBinding {
            index,
            tables,
            column,
            clause,
        });
    }

    /// Bind `placeholder` to whatever column `other` names, if it names one
    fn bind_against(&mut self, placeholder: &Expr, other: &Expr, clause: Clause) -> bool {
        let Some(index) = placeholder_index(placeholder) else {
            return false;
        };
        match self.column_of(other) {
            Some((tables, column)) => {
                self.bind(index, tables, ColumnRef::Named(column), clause);
                true
            }
            None => false,
        }
    }

    /// Bindings ordered by placeholder number
    pub fn into_bindings(mut self) -> Vec<PlaceholderBinding> {
        self.bindings.sort_by_key(|b| b.index);
        self.bindings
    }
}

/// Placeholder number of `$n`, looking through parentheses and casts
pub fn placeholder_index(expr: &Expr) -> Option<usize> {
    match expr {
        Expr::Value(Value::Placeholder(p)) => p.trim_start_matches('$').parse().ok(),
        Expr::Nested(inner) => placeholder_index(inner),
        Expr::Cast { expr, .. } => placeholder_index(expr),
        _ => None,
    }
}

/// Analyze a statement written with positional `$n` placeholders.
///
/// Returns an error string only when the statement cannot be parsed.
pub fn analyze(sql: &str) -> Result<Vec<PlaceholderBinding>, String> {
    let dialect = PostgreSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql).map_err(|e| format!("SQL parse error: {}", e))?;
    if statements.len() != 1 {
        return Err(format!("expected one statement, found {}", statements.len()));
    }
    let statement = statements.remove(0);

    let mut ctx = AnalysisContext::new();
    analyze_statement(&statement, &mut ctx);
    Ok(ctx.into_bindings())
}

fn analyze_statement(statement: &Statement, ctx: &mut AnalysisContext) {
    match statement {
        Statement::Query(query) => analyze_query(query, ctx),
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            register_table_with_joins(table, ctx);
            let target = ctx.scope.first().cloned();
            if let Some(from) = from {
                register_table_with_joins(from, ctx);
            }
            for assignment in assignments {
                let Some(column) = assignment.id.last() else {
                    continue;
                };
                let column = column.value.to_lowercase();
                if let Some(index) = placeholder_index(&assignment.value) {
                    let tables = target.iter().cloned().collect();
                    ctx.bind(index, tables, ColumnRef::Named(column), Clause::Set);
                } else {
                    visit_expr(&assignment.value, ctx, Clause::Set);
                }
            }
            if let Some(selection) = selection {
                visit_expr(selection, ctx, Clause::Where);
            }
        }
        Statement::Delete {
            from,
            using,
            selection,
            ..
        } => {
            for twj in from {
                register_table_with_joins(twj, ctx);
            }
            if let Some(using) = using {
                for twj in using {
                    register_table_with_joins(twj, ctx);
                }
            }
            if let Some(selection) = selection {
                visit_expr(selection, ctx, Clause::Where);
            }
        }
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => {
            let table = ctx.register_table(table_name, None);
            let Some(source) = source else {
                return;
            };
            match source.body.as_ref() {
                SetExpr::Values(values) => {
                    for row in &values.rows {
                        for (pos, expr) in row.iter().enumerate() {
                            let Some(index) = placeholder_index(expr) else {
                                visit_expr(expr, ctx, Clause::Values);
                                continue;
                            };
                            let column = match columns.get(pos) {
                                Some(c) => ColumnRef::Named(c.value.to_lowercase()),
                                None => ColumnRef::Position(pos),
                            };
                            ctx.bind(index, vec![table.clone()], column, Clause::Values);
                        }
                    }
                }
                _ => analyze_query(source, ctx),
            }
        }
        _ => {}
    }
}

fn analyze_query(query: &Query, ctx: &mut AnalysisContext) {
    analyze_set_expr(&query.body, ctx);
}

fn analyze_set_expr(body: &SetExpr, ctx: &mut AnalysisContext) {
    match body {
        SetExpr::Select(select) => {
            let saved = ctx.scope.clone();
            let saved_aliases = ctx.aliases.clone();
            ctx.scope.clear();
            for twj in &select.from {
                register_table_with_joins(twj, ctx);
            }
            // Outer tables stay visible to correlated subqueries
            for outer in saved.iter() {
                if !ctx.scope.contains(outer) {
                    ctx.scope.push(outer.clone());
                }
            }
            for twj in &select.from {
                visit_join_constraints(twj, ctx);
            }
            if let Some(selection) = &select.selection {
                visit_expr(selection, ctx, Clause::Where);
            }
            if let Some(having) = &select.having {
                visit_expr(having, ctx, Clause::Where);
            }
            ctx.scope = saved;
            ctx.aliases = saved_aliases;
        }
        SetExpr::Query(query) => analyze_query(query, ctx),
        SetExpr::SetOperation { left, right, .. } => {
            analyze_set_expr(left, ctx);
            analyze_set_expr(right, ctx);
        }
        _ => {}
    }
}

fn register_table_with_joins(twj: &TableWithJoins, ctx: &mut AnalysisContext) {
    register_factor(&twj.relation, ctx);
    for join in &twj.joins {
        register_factor(&join.relation, ctx);
    }
}

fn register_factor(factor: &TableFactor, ctx: &mut AnalysisContext) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            ctx.register_table(name, alias.as_ref().map(|a| &a.name));
        }
        TableFactor::Derived { subquery, .. } => analyze_query(subquery, ctx),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => register_table_with_joins(table_with_joins, ctx),
        _ => {}
    }
}

fn visit_join_constraints(twj: &TableWithJoins, ctx: &mut AnalysisContext) {
    for join in &twj.joins {
        let constraint = match &join.join_operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => c,
            _ => continue,
        };
        if let JoinConstraint::On(expr) = constraint {
            visit_expr(expr, ctx, Clause::Where);
        }
    }
}

fn visit_expr(expr: &Expr, ctx: &mut AnalysisContext, clause: Clause) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            if ctx.bind_against(right, left, clause) || ctx.bind_against(left, right, clause) {
                return;
            }
            visit_expr(left, ctx, clause);
            visit_expr(right, ctx, clause);
        }
        Expr::Between { expr, low, high, .. } => {
            ctx.bind_against(low, expr, clause);
            ctx.bind_against(high, expr, clause);
            visit_expr(expr, ctx, clause);
            visit_expr(low, ctx, clause);
            visit_expr(high, ctx, clause);
        }
        Expr::InList { expr, list, .. } => {
            for item in list {
                if !ctx.bind_against(item, expr, clause) {
                    visit_expr(item, ctx, clause);
                }
            }
            visit_expr(expr, ctx, clause);
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            if !ctx.bind_against(pattern, expr, clause) {
                visit_expr(pattern, ctx, clause);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            visit_expr(expr, ctx, clause);
            analyze_query(subquery, ctx);
        }
        Expr::Exists { subquery, .. } => analyze_query(subquery, ctx),
        Expr::Subquery(query) => analyze_query(query, ctx),
        Expr::Nested(inner) | Expr::IsNull(inner) | Expr::IsNotNull(inner) => visit_expr(inner, ctx, clause),
        Expr::UnaryOp { expr, .. } => visit_expr(expr, ctx, clause),
        Expr::Cast { expr, .. } => visit_expr(expr, ctx, clause),
        Expr::Tuple(items) => {
            for item in items {
                visit_expr(item, ctx, clause);
            }
        }
        _ => {}
    }
}

/// Lowercase dotted name (`Public.Accounts` -> `public.accounts`)
fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}
