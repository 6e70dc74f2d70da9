//! Tree-walking evaluator for the script language.
//!
//! One evaluation owns one environment arena; nothing survives the run.
//! Capability-sensitive globals route through the job's capability set,
//! counters go to the shared meter, and the interrupt flag is polled at
//! every statement and loop iteration.

use super::{InterruptHandle, IsolateJob, IsolateOutcome};
use crate::events::EventSink;
use crate::lang::{self, ast};
use crate::monitor::ExecutionMeter;
use crate::policy::{AccessDecision, AccessKind, Capability, CapabilitySet};
use corral_common::{ExecutionId, MonitoringEvent, MonitoringEventType, SandboxError};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

const MAX_CONSOLE_LINES: usize = 1000;

/// Properties that walk toward the host prototype chain. Touching them is
/// a policy breach on any value.
const POLLUTION_PROPS: &[&str] = &["__proto__", "prototype", "constructor"];

#[derive(Debug)]
pub(super) enum ScriptError {
    /// Uncaught script-level failure.
    Runtime(String),
    /// Typed sandbox error: access violation or resource ceiling.
    Halt(SandboxError),
    /// The interrupt flag was observed; the reason lives on the handle.
    Interrupted,
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

type NativeImpl = Rc<dyn Fn(&mut Interp, Vec<Value>) -> Result<Value, ScriptError>>;

#[derive(Clone)]
struct NativeFn {
    name: &'static str,
    call: NativeImpl,
}

struct ScriptFn {
    name: Option<String>,
    params: Vec<String>,
    body: Rc<Vec<ast::Stmt>>,
    env: EnvRef,
}

/// A capability-gated host namespace (`document`, `fs`, `system`).
struct HostObject {
    name: &'static str,
    capability: Capability,
    read_methods: &'static [&'static str],
    write_methods: &'static [&'static str],
}

#[derive(Clone)]
enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<String>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<BTreeMap<String, Value>>>),
    Func(Rc<ScriptFn>),
    Native(NativeFn),
    Host(Rc<HostObject>),
}

impl Value {
    fn str(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(s.into()))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Func(_) | Value::Native(_) => "function",
            Value::Host(_) => "object",
        }
    }
}

type EnvRef = Rc<RefCell<Env>>;

struct Env {
    vars: HashMap<String, Value>,
    parent: Option<EnvRef>,
}

impl Env {
    fn root() -> EnvRef {
        Rc::new(RefCell::new(Env {
            vars: HashMap::new(),
            parent: None,
        }))
    }

    fn child(parent: &EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Env {
            vars: HashMap::new(),
            parent: Some(parent.clone()),
        }))
    }

    fn lookup(env: &EnvRef, name: &str) -> Option<Value> {
        let mut current = env.clone();
        loop {
            if let Some(value) = current.borrow().vars.get(name) {
                return Some(value.clone());
            }
            let parent = current.borrow().parent.clone();
            match parent {
                Some(p) => current = p,
                None => return None,
            }
        }
    }

    fn assign(env: &EnvRef, name: &str, value: Value) -> bool {
        let mut current = env.clone();
        loop {
            if current.borrow().vars.contains_key(name) {
                current.borrow_mut().vars.insert(name.to_string(), value);
                return true;
            }
            let parent = current.borrow().parent.clone();
            match parent {
                Some(p) => current = p,
                None => return false,
            }
        }
    }

    fn declare(env: &EnvRef, name: &str, value: Value) {
        env.borrow_mut().vars.insert(name.to_string(), value);
    }
}

pub(super) fn evaluate(job: IsolateJob) -> Result<IsolateOutcome, ScriptError> {
    let parsed = lang::parse(&job.code).map_err(|e| {
        ScriptError::Halt(SandboxError::syntax(e.line, e.column, e.message))
    })?;

    let mut interp = Interp::new(&job);
    interp.install_globals(&job);

    let scope = Env::child(&interp.globals);
    let mut last = Value::Null;
    for stmt in &parsed.program.body {
        if let ast::Stmt::Expr(expr) = stmt {
            interp.check_interrupt()?;
            last = interp.eval(expr, &scope)?;
        } else {
            match interp.exec_stmt(stmt, &scope)? {
                Flow::Normal => {}
                Flow::Return(_) | Flow::Break | Flow::Continue => {
                    return Err(ScriptError::Runtime(
                        "`return`, `break` and `continue` are only valid inside functions and loops"
                            .to_string(),
                    ));
                }
            }
        }
    }

    interp.drain_timers()?;

    Ok(IsolateOutcome {
        value: value_to_json(&last),
        console: interp.console,
    })
}

struct Interp {
    meter: Arc<ExecutionMeter>,
    caps: Arc<CapabilitySet>,
    interrupt: InterruptHandle,
    sink: EventSink,
    execution_id: ExecutionId,
    strict: bool,
    stack_traces: bool,
    globals: EnvRef,
    console: Vec<String>,
    frames: Vec<String>,
    timers: VecDeque<(f64, Value, Vec<Value>)>,
    next_timer: f64,
    rng_state: u64,
}

impl Interp {
    fn new(job: &IsolateJob) -> Self {
        let seed = u64::from_le_bytes(
            job.execution_id.0.as_bytes()[..8]
                .try_into()
                .expect("uuid has 16 bytes"),
        );
        Self {
            meter: job.meter.clone(),
            caps: job.capabilities.clone(),
            interrupt: job.interrupt.clone(),
            sink: job.sink.clone(),
            execution_id: job.execution_id,
            strict: job.basic.strict_mode,
            stack_traces: job.stack_traces,
            globals: Env::root(),
            console: Vec::new(),
            frames: Vec::new(),
            timers: VecDeque::new(),
            next_timer: 1.0,
            rng_state: seed | 1,
        }
    }

    // ---- host surface ----

    fn install_globals(&mut self, job: &IsolateJob) {
        let globals = self.globals.clone();

        for (name, value) in &job.basic.injected_globals {
            Env::declare(&globals, name, json_to_value(value));
        }
        for (name, value) in &job.context {
            Env::declare(&globals, name, json_to_value(value));
        }

        if job.basic.enable_console {
            Env::declare(&globals, "console", console_object());
        }
        Env::declare(&globals, "Math", math_object());
        Env::declare(&globals, "JSON", json_object());

        Env::declare(&globals, "parseInt", native("parseInt", |_, args| {
            let text = arg_string(&args, 0, "parseInt")?;
            Ok(text
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n as f64))
                .unwrap_or(Value::Number(f64::NAN)))
        }));
        Env::declare(&globals, "parseFloat", native("parseFloat", |_, args| {
            let text = arg_string(&args, 0, "parseFloat")?;
            Ok(text
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or(Value::Number(f64::NAN)))
        }));
        Env::declare(&globals, "String", native("String", |_, args| {
            Ok(Value::str(display_value(args.first().unwrap_or(&Value::Null))))
        }));
        Env::declare(&globals, "Number", native("Number", |_, args| {
            Ok(match args.first() {
                Some(Value::Number(n)) => Value::Number(*n),
                Some(Value::Bool(b)) => Value::Number(if *b { 1.0 } else { 0.0 }),
                Some(Value::Str(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Number)
                    .unwrap_or(Value::Number(f64::NAN)),
                _ => Value::Number(f64::NAN),
            })
        }));

        // Capability-gated surface
        Env::declare(&globals, "fetch", native("fetch", |interp, args| {
            interp.gate(Capability::Network, "fetch", AccessKind::Invoke)?;
            let _ = args;
            Ok(Value::Null)
        }));
        Env::declare(&globals, "require", native("require", |interp, args| {
            let module = arg_string(&args, 0, "require")?;
            let operation = format!("require:{}", module);
            interp.gate(Capability::ThirdPartyLibs, &operation, AccessKind::Invoke)?;
            Ok(Value::Null)
        }));

        if job.basic.enable_dom {
            Env::declare(
                &globals,
                "document",
                Value::Host(Rc::new(HostObject {
                    name: "document",
                    capability: Capability::Dom,
                    read_methods: &["getElementById", "querySelector", "getAttribute"],
                    write_methods: &["write", "appendChild", "setAttribute"],
                })),
            );
        }
        Env::declare(
            &globals,
            "fs",
            Value::Host(Rc::new(HostObject {
                name: "fs",
                capability: Capability::FileSystem,
                read_methods: &["readFile", "readDir", "exists"],
                write_methods: &["writeFile", "appendFile", "remove"],
            })),
        );
        Env::declare(
            &globals,
            "system",
            Value::Host(Rc::new(HostObject {
                name: "system",
                capability: Capability::SystemApi,
                read_methods: &["env", "platform"],
                write_methods: &[],
            })),
        );

        if job.basic.enable_timers {
            Env::declare(&globals, "setTimeout", native("setTimeout", |interp, mut args| {
                if args.is_empty() {
                    return Err(ScriptError::Runtime(
                        "setTimeout expects a callback".to_string(),
                    ));
                }
                let callback = args.remove(0);
                if !matches!(callback, Value::Func(_) | Value::Native(_)) {
                    return Err(ScriptError::Runtime(
                        "setTimeout callback must be a function".to_string(),
                    ));
                }
                // Delay argument is accepted and ignored: callbacks run
                // in registration order once the main body completes.
                if !args.is_empty() {
                    args.remove(0);
                }
                let id = interp.next_timer;
                interp.next_timer += 1.0;
                interp.timers.push_back((id, callback, args));
                Ok(Value::Number(id))
            }));
            Env::declare(&globals, "clearTimeout", native("clearTimeout", |interp, args| {
                if let Some(Value::Number(id)) = args.first() {
                    let id = *id;
                    interp.timers.retain(|(timer_id, _, _)| *timer_id != id);
                }
                Ok(Value::Null)
            }));
        }
    }

    fn drain_timers(&mut self) -> Result<(), ScriptError> {
        while let Some((_, callback, args)) = self.timers.pop_front() {
            self.meter.loop_tick().map_err(ScriptError::Halt)?;
            self.call_value(callback, args)?;
        }
        Ok(())
    }

    // ---- policy plumbing ----

    fn gate(
        &mut self,
        capability: Capability,
        operation: &str,
        access: AccessKind,
    ) -> Result<(), ScriptError> {
        match self.caps.check(capability, operation, access) {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Warn { rule } => {
                (self.sink)(
                    MonitoringEvent::new(MonitoringEventType::SecurityEvent)
                        .for_execution(self.execution_id)
                        .with_message(format!("rule `{}` matched `{}`", rule, operation))
                        .with_data(serde_json::json!({
                            "rule": rule,
                            "operation": operation,
                        })),
                );
                Ok(())
            }
            AccessDecision::Deny { error } => Err(ScriptError::Halt(error)),
        }
    }

    fn check_interrupt(&self) -> Result<(), ScriptError> {
        if self.interrupt.is_interrupted() {
            Err(ScriptError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn guard_property(&self, property: &str) -> Result<(), ScriptError> {
        if POLLUTION_PROPS.contains(&property) {
            return Err(ScriptError::Halt(SandboxError::security_violation(format!(
                "prototype access via `{}` is not permitted",
                property
            ))));
        }
        Ok(())
    }

    // ---- statements ----

    fn exec_stmts(&mut self, stmts: &[ast::Stmt], env: &EnvRef) -> Result<Flow, ScriptError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &ast::Stmt, env: &EnvRef) -> Result<Flow, ScriptError> {
        self.check_interrupt()?;
        match stmt {
            ast::Stmt::Expr(expr) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            ast::Stmt::VarDecl { name, init, .. } => {
                let value = match init {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::Null,
                };
                Env::declare(env, name, value);
                Ok(Flow::Normal)
            }
            ast::Stmt::FuncDecl { name, params, body } => {
                self.meter.add_memory(128);
                let func = Value::Func(Rc::new(ScriptFn {
                    name: Some(name.clone()),
                    params: params.clone(),
                    body: Rc::new(body.clone()),
                    env: env.clone(),
                }));
                Env::declare(env, name, func);
                Ok(Flow::Normal)
            }
            ast::Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            ast::Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.eval(cond, env)?;
                if truthy(&cond) {
                    self.exec_stmts(then_branch, &Env::child(env))
                } else if let Some(else_branch) = else_branch {
                    self.exec_stmts(else_branch, &Env::child(env))
                } else {
                    Ok(Flow::Normal)
                }
            }
            ast::Stmt::While { cond, body } => {
                loop {
                    self.check_interrupt()?;
                    self.meter.loop_tick().map_err(ScriptError::Halt)?;
                    if !truthy(&self.eval(cond, env)?) {
                        break;
                    }
                    match self.exec_stmts(body, &Env::child(env))? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            ast::Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                let loop_env = Env::child(env);
                if let Some(init) = init {
                    self.exec_stmt(init, &loop_env)?;
                }
                loop {
                    self.check_interrupt()?;
                    self.meter.loop_tick().map_err(ScriptError::Halt)?;
                    if let Some(cond) = cond {
                        if !truthy(&self.eval(cond, &loop_env)?) {
                            break;
                        }
                    }
                    match self.exec_stmts(body, &Env::child(&loop_env))? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                    if let Some(step) = step {
                        self.eval(step, &loop_env)?;
                    }
                }
                Ok(Flow::Normal)
            }
            ast::Stmt::Break => Ok(Flow::Break),
            ast::Stmt::Continue => Ok(Flow::Continue),
            ast::Stmt::Block(body) => self.exec_stmts(body, &Env::child(env)),
        }
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &ast::Expr, env: &EnvRef) -> Result<Value, ScriptError> {
        match expr {
            ast::Expr::Number(n) => Ok(Value::Number(*n)),
            ast::Expr::Str(s) => {
                self.meter.add_memory(s.len() as u64);
                Ok(Value::str(s.clone()))
            }
            ast::Expr::Bool(b) => Ok(Value::Bool(*b)),
            ast::Expr::Null => Ok(Value::Null),
            ast::Expr::Array(items) => {
                self.meter.add_memory(16 * items.len() as u64);
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, env)?);
                }
                Ok(Value::Array(Rc::new(RefCell::new(values))))
            }
            ast::Expr::Object(entries) => {
                self.meter.add_memory(64 * entries.len() as u64);
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    self.guard_property(key)?;
                    map.insert(key.clone(), self.eval(value, env)?);
                }
                Ok(Value::Object(Rc::new(RefCell::new(map))))
            }
            ast::Expr::Ident(name) => self.resolve_ident(name, env),
            ast::Expr::Assign { target, op, value } => {
                let rhs = self.eval(value, env)?;
                let new_value = match op {
                    ast::AssignOp::Assign => rhs,
                    compound => {
                        let current = self.eval(target, env)?;
                        let binary = match compound {
                            ast::AssignOp::Add => ast::BinaryOp::Add,
                            ast::AssignOp::Sub => ast::BinaryOp::Sub,
                            ast::AssignOp::Mul => ast::BinaryOp::Mul,
                            ast::AssignOp::Div => ast::BinaryOp::Div,
                            ast::AssignOp::Assign => unreachable!(),
                        };
                        self.apply_binary(binary, current, rhs)?
                    }
                };
                self.assign_to(target, new_value.clone(), env)?;
                Ok(new_value)
            }
            ast::Expr::Unary { op, expr } => {
                let value = self.eval(expr, env)?;
                match op {
                    ast::UnaryOp::Neg => match value {
                        Value::Number(n) => Ok(Value::Number(-n)),
                        other => Err(ScriptError::Runtime(format!(
                            "cannot negate a {}",
                            other.type_name()
                        ))),
                    },
                    ast::UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                }
            }
            ast::Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, env)?;
                let rhs = self.eval(rhs, env)?;
                self.apply_binary(*op, lhs, rhs)
            }
            ast::Expr::Logical { op, lhs, rhs } => {
                let lhs = self.eval(lhs, env)?;
                match op {
                    ast::LogicalOp::And => {
                        if truthy(&lhs) {
                            self.eval(rhs, env)
                        } else {
                            Ok(lhs)
                        }
                    }
                    ast::LogicalOp::Or => {
                        if truthy(&lhs) {
                            Ok(lhs)
                        } else {
                            self.eval(rhs, env)
                        }
                    }
                }
            }
            ast::Expr::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                if truthy(&self.eval(cond, env)?) {
                    self.eval(then_expr, env)
                } else {
                    self.eval(else_expr, env)
                }
            }
            ast::Expr::Call { callee, args } => {
                let mut argv = Vec::with_capacity(args.len());
                for arg in args {
                    argv.push(self.eval(arg, env)?);
                }
                if let ast::Expr::Member { object, property } = &**callee {
                    let receiver = self.eval(object, env)?;
                    self.call_method(receiver, property, argv)
                } else {
                    let callee = self.eval(callee, env)?;
                    self.call_value(callee, argv)
                }
            }
            ast::Expr::Member { object, property } => {
                self.guard_property(property)?;
                let object = self.eval(object, env)?;
                self.member_get(object, property)
            }
            ast::Expr::Index { object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                self.index_get(object, index)
            }
            ast::Expr::Func { params, body } => {
                self.meter.add_memory(128);
                Ok(Value::Func(Rc::new(ScriptFn {
                    name: None,
                    params: params.clone(),
                    body: Rc::new(body.clone()),
                    env: env.clone(),
                })))
            }
            ast::Expr::Update { target, op, prefix } => {
                let current = self.eval(target, env)?;
                let Value::Number(n) = current else {
                    return Err(ScriptError::Runtime(format!(
                        "cannot increment a {}",
                        current.type_name()
                    )));
                };
                let delta = match op {
                    ast::UpdateOp::Incr => 1.0,
                    ast::UpdateOp::Decr => -1.0,
                };
                let updated = Value::Number(n + delta);
                self.assign_to(target, updated.clone(), env)?;
                Ok(if *prefix { updated } else { Value::Number(n) })
            }
        }
    }

    fn resolve_ident(&mut self, name: &str, env: &EnvRef) -> Result<Value, ScriptError> {
        if let Some(err) = self.caps.check_identifier(name) {
            return Err(ScriptError::Halt(err));
        }
        if let Some(value) = Env::lookup(env, name) {
            return Ok(value);
        }
        if self.caps.is_explicitly_allowed(name) {
            // Granted but unbound: the host allowed the name without
            // providing a value.
            return Ok(Value::Null);
        }
        Err(ScriptError::Runtime(format!("`{}` is not defined", name)))
    }

    fn assign_to(
        &mut self,
        target: &ast::Expr,
        value: Value,
        env: &EnvRef,
    ) -> Result<(), ScriptError> {
        match target {
            ast::Expr::Ident(name) => {
                if let Some(err) = self.caps.check_identifier(name) {
                    return Err(ScriptError::Halt(err));
                }
                if Env::assign(env, name, value.clone()) {
                    return Ok(());
                }
                if self.strict {
                    return Err(ScriptError::Runtime(format!(
                        "assignment to undeclared variable `{}`",
                        name
                    )));
                }
                Env::declare(&self.globals, name, value);
                Ok(())
            }
            ast::Expr::Member { object, property } => {
                self.guard_property(property)?;
                let object = self.eval(object, env)?;
                match object {
                    Value::Object(map) => {
                        self.meter.add_memory(64 + property.len() as u64);
                        map.borrow_mut().insert(property.clone(), value);
                        Ok(())
                    }
                    Value::Host(host) => {
                        let operation = format!("{}.{}", host.name, property);
                        self.gate(host.capability, &operation, AccessKind::Write)?;
                        Ok(())
                    }
                    other => Err(ScriptError::Runtime(format!(
                        "cannot set property `{}` on a {}",
                        property,
                        other.type_name()
                    ))),
                }
            }
            ast::Expr::Index { object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                match (object, index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let idx = as_index(n)?;
                        let mut items = items.borrow_mut();
                        if idx < items.len() {
                            items[idx] = value;
                        } else if idx == items.len() {
                            self.meter.add_memory(16);
                            items.push(value);
                        } else {
                            return Err(ScriptError::Runtime(format!(
                                "index {} is out of bounds for length {}",
                                idx,
                                items.len()
                            )));
                        }
                        Ok(())
                    }
                    (Value::Object(map), Value::Str(key)) => {
                        self.guard_property(&key)?;
                        self.meter.add_memory(64 + key.len() as u64);
                        map.borrow_mut().insert(key.as_ref().clone(), value);
                        Ok(())
                    }
                    (object, index) => Err(ScriptError::Runtime(format!(
                        "cannot index a {} with a {}",
                        object.type_name(),
                        index.type_name()
                    ))),
                }
            }
            _ => Err(ScriptError::Runtime("invalid assignment target".to_string())),
        }
    }

    fn apply_binary(
        &mut self,
        op: ast::BinaryOp,
        lhs: Value,
        rhs: Value,
    ) -> Result<Value, ScriptError> {
        use ast::BinaryOp::*;
        match op {
            Add => match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    let text = format!("{}{}", display_value(&lhs), display_value(&rhs));
                    self.meter.add_memory(text.len() as u64);
                    Ok(Value::str(text))
                }
                _ => Err(ScriptError::Runtime(format!(
                    "cannot add a {} and a {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))),
            },
            Sub | Mul | Div | Rem => match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(match op {
                    Sub => a - b,
                    Mul => a * b,
                    Div => a / b,
                    Rem => a % b,
                    _ => unreachable!(),
                })),
                _ => Err(ScriptError::Runtime(format!(
                    "arithmetic requires numbers, got {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))),
            },
            Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
            NotEq => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
            Lt | LtEq | Gt | GtEq => match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Bool(match op {
                    Lt => a < b,
                    LtEq => a <= b,
                    Gt => a > b,
                    GtEq => a >= b,
                    _ => unreachable!(),
                })),
                (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(match op {
                    Lt => a < b,
                    LtEq => a <= b,
                    Gt => a > b,
                    GtEq => a >= b,
                    _ => unreachable!(),
                })),
                _ => Err(ScriptError::Runtime(format!(
                    "cannot compare a {} with a {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))),
            },
        }
    }

    fn member_get(&mut self, object: Value, property: &str) -> Result<Value, ScriptError> {
        match object {
            Value::Object(map) => Ok(map.borrow().get(property).cloned().unwrap_or(Value::Null)),
            Value::Array(items) => match property {
                "length" => Ok(Value::Number(items.borrow().len() as f64)),
                _ => Ok(Value::Null),
            },
            Value::Str(s) => match property {
                "length" => Ok(Value::Number(s.chars().count() as f64)),
                _ => Ok(Value::Null),
            },
            Value::Host(host) => {
                let operation = format!("{}.{}", host.name, property);
                self.gate(host.capability, &operation, AccessKind::Read)?;
                Ok(Value::Null)
            }
            other => Err(ScriptError::Runtime(format!(
                "cannot read property `{}` of a {}",
                property,
                other.type_name()
            ))),
        }
    }

    fn index_get(&mut self, object: Value, index: Value) -> Result<Value, ScriptError> {
        match (object, index) {
            (Value::Array(items), Value::Number(n)) => {
                let idx = as_index(n)?;
                Ok(items.borrow().get(idx).cloned().unwrap_or(Value::Null))
            }
            (Value::Str(s), Value::Number(n)) => {
                let idx = as_index(n)?;
                Ok(s.chars()
                    .nth(idx)
                    .map(|c| Value::str(c.to_string()))
                    .unwrap_or(Value::Null))
            }
            (Value::Object(map), Value::Str(key)) => {
                self.guard_property(&key)?;
                Ok(map.borrow().get(key.as_str()).cloned().unwrap_or(Value::Null))
            }
            (object, index) => Err(ScriptError::Runtime(format!(
                "cannot index a {} with a {}",
                object.type_name(),
                index.type_name()
            ))),
        }
    }

    fn call_method(
        &mut self,
        receiver: Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        self.guard_property(method)?;
        match receiver {
            Value::Host(host) => {
                let operation = format!("{}.{}", host.name, method);
                let access = if host.write_methods.contains(&method) {
                    AccessKind::Write
                } else if host.read_methods.contains(&method) {
                    AccessKind::Read
                } else {
                    AccessKind::Invoke
                };
                self.gate(host.capability, &operation, access)?;
                Ok(Value::Null)
            }
            Value::Array(items) => self.array_method(items, method, args),
            Value::Str(s) => self.string_method(&s, method, args),
            Value::Object(map) => {
                let member = map.borrow().get(method).cloned();
                match member {
                    Some(func) => self.call_value(func, args),
                    None => Err(ScriptError::Runtime(format!(
                        "`{}` is not a function",
                        method
                    ))),
                }
            }
            other => Err(ScriptError::Runtime(format!(
                "cannot call `{}` on a {}",
                method,
                other.type_name()
            ))),
        }
    }

    fn array_method(
        &mut self,
        items: Rc<RefCell<Vec<Value>>>,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        match method {
            "push" => {
                let mut items = items.borrow_mut();
                for value in args.drain(..) {
                    self.meter.add_memory(16);
                    items.push(value);
                }
                Ok(Value::Number(items.len() as f64))
            }
            "pop" => Ok(items.borrow_mut().pop().unwrap_or(Value::Null)),
            "indexOf" => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                let items = items.borrow();
                let found = items
                    .iter()
                    .position(|v| values_equal(v, &needle))
                    .map(|i| i as f64)
                    .unwrap_or(-1.0);
                Ok(Value::Number(found))
            }
            "join" => {
                let separator = match args.first() {
                    Some(Value::Str(s)) => s.as_ref().clone(),
                    _ => ",".to_string(),
                };
                let items = items.borrow();
                let text = items
                    .iter()
                    .map(display_value)
                    .collect::<Vec<_>>()
                    .join(&separator);
                self.meter.add_memory(text.len() as u64);
                Ok(Value::str(text))
            }
            "slice" => {
                let items_ref = items.borrow();
                let len = items_ref.len() as f64;
                let start = match args.first() {
                    Some(Value::Number(n)) => clamp_index(*n, len),
                    _ => 0,
                };
                let end = match args.get(1) {
                    Some(Value::Number(n)) => clamp_index(*n, len),
                    _ => items_ref.len(),
                };
                let slice: Vec<Value> = items_ref
                    .get(start..end.max(start))
                    .map(|s| s.to_vec())
                    .unwrap_or_default();
                self.meter.add_memory(16 * slice.len() as u64);
                Ok(Value::Array(Rc::new(RefCell::new(slice))))
            }
            other => Err(ScriptError::Runtime(format!(
                "arrays have no method `{}`",
                other
            ))),
        }
    }

    fn string_method(
        &mut self,
        s: &Rc<String>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        match method {
            "toUpperCase" => {
                let text = s.to_uppercase();
                self.meter.add_memory(text.len() as u64);
                Ok(Value::str(text))
            }
            "toLowerCase" => {
                let text = s.to_lowercase();
                self.meter.add_memory(text.len() as u64);
                Ok(Value::str(text))
            }
            "indexOf" => {
                let needle = arg_string(&args, 0, "indexOf")?;
                let found = s
                    .find(needle.as_str())
                    .map(|byte| s[..byte].chars().count() as f64)
                    .unwrap_or(-1.0);
                Ok(Value::Number(found))
            }
            "substring" => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as f64;
                let start = match args.first() {
                    Some(Value::Number(n)) => clamp_index(*n, len),
                    _ => 0,
                };
                let end = match args.get(1) {
                    Some(Value::Number(n)) => clamp_index(*n, len),
                    _ => chars.len(),
                };
                let (start, end) = if start <= end { (start, end) } else { (end, start) };
                let text: String = chars[start..end].iter().collect();
                self.meter.add_memory(text.len() as u64);
                Ok(Value::str(text))
            }
            "split" => {
                let separator = arg_string(&args, 0, "split")?;
                let parts: Vec<Value> = if separator.is_empty() {
                    s.chars().map(|c| Value::str(c.to_string())).collect()
                } else {
                    s.split(separator.as_str())
                        .map(|part| Value::str(part.to_string()))
                        .collect()
                };
                self.meter
                    .add_memory(s.len() as u64 + 16 * parts.len() as u64);
                Ok(Value::Array(Rc::new(RefCell::new(parts))))
            }
            "trim" => Ok(Value::str(s.trim().to_string())),
            other => Err(ScriptError::Runtime(format!(
                "strings have no method `{}`",
                other
            ))),
        }
    }

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, ScriptError> {
        match callee {
            Value::Func(func) => self.call_script_fn(&func, args),
            Value::Native(native) => {
                let call = native.call.clone();
                call(self, args)
            }
            other => Err(ScriptError::Runtime(format!(
                "a {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_script_fn(&mut self, func: &ScriptFn, args: Vec<Value>) -> Result<Value, ScriptError> {
        self.check_interrupt()?;
        self.meter.enter_call().map_err(ScriptError::Halt)?;
        self.frames.push(
            func.name
                .clone()
                .unwrap_or_else(|| "<anonymous>".to_string()),
        );

        let scope = Env::child(&func.env);
        for (i, param) in func.params.iter().enumerate() {
            Env::declare(&scope, param, args.get(i).cloned().unwrap_or(Value::Null));
        }

        let result = self.exec_stmts(&func.body, &scope);

        self.frames.pop();
        self.meter.exit_call();

        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::Null),
            Err(ScriptError::Runtime(message)) if self.stack_traces => {
                let mut stack = self.frames.clone();
                stack.push(
                    func.name
                        .clone()
                        .unwrap_or_else(|| "<anonymous>".to_string()),
                );
                Err(ScriptError::Halt(
                    SandboxError::runtime(message)
                        .with_context(serde_json::json!({ "stack": stack })),
                ))
            }
            Err(err) => Err(err),
        }
    }

    fn console_write(&mut self, level: &str, args: &[Value]) {
        if self.console.len() >= MAX_CONSOLE_LINES {
            return;
        }
        let line = args
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(" ");
        self.meter.add_memory(line.len() as u64);
        if level == "log" {
            self.console.push(line);
        } else {
            self.console.push(format!("[{}] {}", level, line));
        }
    }

    fn random(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}

// ---- builtin objects ----

fn native(
    name: &'static str,
    f: impl Fn(&mut Interp, Vec<Value>) -> Result<Value, ScriptError> + 'static,
) -> Value {
    Value::Native(NativeFn {
        name,
        call: Rc::new(f),
    })
}

fn console_object() -> Value {
    let mut map = BTreeMap::new();
    for level in ["log", "warn", "error", "info"] {
        map.insert(
            level.to_string(),
            native(match level {
                "log" => "console.log",
                "warn" => "console.warn",
                "error" => "console.error",
                _ => "console.info",
            }, move |interp, args| {
                interp.console_write(level, &args);
                Ok(Value::Null)
            }),
        );
    }
    Value::Object(Rc::new(RefCell::new(map)))
}

fn math_object() -> Value {
    let mut map = BTreeMap::new();
    map.insert("PI".to_string(), Value::Number(std::f64::consts::PI));
    map.insert("E".to_string(), Value::Number(std::f64::consts::E));

    let unary = |name: &'static str, f: fn(f64) -> f64| {
        native(name, move |_, args| match args.first() {
            Some(Value::Number(n)) => Ok(Value::Number(f(*n))),
            _ => Err(ScriptError::Runtime(format!("{} expects a number", name))),
        })
    };
    map.insert("abs".to_string(), unary("Math.abs", f64::abs));
    map.insert("floor".to_string(), unary("Math.floor", f64::floor));
    map.insert("ceil".to_string(), unary("Math.ceil", f64::ceil));
    map.insert("round".to_string(), unary("Math.round", f64::round));
    map.insert("sqrt".to_string(), unary("Math.sqrt", f64::sqrt));

    map.insert("pow".to_string(), native("Math.pow", |_, args| {
        match (args.first(), args.get(1)) {
            (Some(Value::Number(base)), Some(Value::Number(exp))) => {
                Ok(Value::Number(base.powf(*exp)))
            }
            _ => Err(ScriptError::Runtime("Math.pow expects two numbers".to_string())),
        }
    }));
    map.insert("min".to_string(), native("Math.min", |_, args| {
        fold_numbers(args, f64::INFINITY, f64::min)
    }));
    map.insert("max".to_string(), native("Math.max", |_, args| {
        fold_numbers(args, f64::NEG_INFINITY, f64::max)
    }));
    map.insert("random".to_string(), native("Math.random", |interp, _| {
        Ok(Value::Number(interp.random()))
    }));

    Value::Object(Rc::new(RefCell::new(map)))
}

fn json_object() -> Value {
    let mut map = BTreeMap::new();
    map.insert("stringify".to_string(), native("JSON.stringify", |interp, args| {
        let value = args.first().unwrap_or(&Value::Null);
        let text = serde_json::to_string(&value_to_json(value))
            .map_err(|e| ScriptError::Runtime(format!("JSON.stringify failed: {}", e)))?;
        interp.meter.add_memory(text.len() as u64);
        Ok(Value::str(text))
    }));
    map.insert("parse".to_string(), native("JSON.parse", |interp, args| {
        let text = arg_string(&args, 0, "JSON.parse")?;
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ScriptError::Runtime(format!("JSON.parse failed: {}", e)))?;
        interp.meter.add_memory(text.len() as u64);
        Ok(json_to_value(&parsed))
    }));
    Value::Object(Rc::new(RefCell::new(map)))
}

fn fold_numbers(
    args: Vec<Value>,
    init: f64,
    f: fn(f64, f64) -> f64,
) -> Result<Value, ScriptError> {
    let mut acc = init;
    for arg in &args {
        match arg {
            Value::Number(n) => acc = f(acc, *n),
            other => {
                return Err(ScriptError::Runtime(format!(
                    "expected numbers, got a {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(Value::Number(acc))
}

// ---- value helpers ----

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::Str(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) | Value::Func(_) | Value::Native(_) | Value::Host(_) => {
            true
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

fn as_index(n: f64) -> Result<usize, ScriptError> {
    if n.fract() == 0.0 && n >= 0.0 && n < usize::MAX as f64 {
        Ok(n as usize)
    } else {
        Err(ScriptError::Runtime(format!("invalid index {}", n)))
    }
}

fn clamp_index(n: f64, len: f64) -> usize {
    let n = if n < 0.0 { (len + n).max(0.0) } else { n };
    n.min(len) as usize
}

fn arg_string(args: &[Value], index: usize, what: &str) -> Result<Rc<String>, ScriptError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(other) => Err(ScriptError::Runtime(format!(
            "{} expects a string, got a {}",
            what,
            other.type_name()
        ))),
        None => Err(ScriptError::Runtime(format!("{} expects a string", what))),
    }
}

fn fmt_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => fmt_number(*n),
        Value::Str(s) => s.as_ref().clone(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(&value_to_json(value)).unwrap_or_else(|_| "null".to_string())
        }
        Value::Func(_) => "[function]".to_string(),
        Value::Native(native) => format!("[function {}]", native.name),
        Value::Host(host) => format!("[object {}]", host.name),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => {
            if n.is_finite() && n.fract() == 0.0 && n.abs() < 9e15 {
                serde_json::Value::from(*n as i64)
            } else {
                serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::Str(s) => serde_json::Value::String(s.as_ref().clone()),
        Value::Array(items) => {
            serde_json::Value::Array(items.borrow().iter().map(value_to_json).collect())
        }
        Value::Object(map) => serde_json::Value::Object(
            map.borrow()
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        Value::Func(_) | Value::Native(_) | Value::Host(_) => serde_json::Value::Null,
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::str(s.clone()),
        serde_json::Value::Array(items) => Value::Array(Rc::new(RefCell::new(
            items.iter().map(json_to_value).collect(),
        ))),
        serde_json::Value::Object(map) => Value::Object(Rc::new(RefCell::new(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ))),
    }
}
