use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::subscribe::ListenerEntry;
use super::validation::{ValidationError, ValidatorChain};

pub type Value = serde_json::Value;
pub type ValueMap = BTreeMap<FieldName, Value>;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldName(Arc<str>);

impl FieldName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FieldName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for FieldName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&FieldName> for FieldName {
    fn from(name: &FieldName) -> Self {
        name.clone()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormStatus {
    Idle,
    Submitting,
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidateMode {
    OnChange,
    OnBlur,
    OnSubmit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevalidateMode {
    OnChange,
    OnBlur,
    OnSubmit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FormOptions {
    pub validate_on: ValidateMode,
    pub revalidate_on: RevalidateMode,
    pub debug: bool,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            validate_on: ValidateMode::OnBlur,
            revalidate_on: RevalidateMode::OnChange,
            debug: false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldProps {
    pub name: FieldName,
    pub value: Value,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldMeta<E> {
    pub dirty: bool,
    pub touched: bool,
    pub validating: bool,
    pub has_validated: bool,
    pub error: Option<E>,
}

#[derive(Clone, Debug)]
pub struct FormSnapshot<E> {
    pub values: ValueMap,
    pub errors: BTreeMap<FieldName, E>,
    pub touched: BTreeMap<FieldName, bool>,
    pub status: FormStatus,
    pub submit_count: u32,
    pub is_dirty: bool,
    pub is_valid: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FormError {
    StatePoisoned(&'static str),
    InvalidStateTransition { from: FormStatus, to: FormStatus },
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::StatePoisoned(context) => {
                write!(f, "form state lock poisoned while {context}")
            }
            FormError::InvalidStateTransition { from, to } => {
                write!(f, "invalid form status transition: {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

pub(super) type OnErrorFn<E> = Arc<dyn Fn(&BTreeMap<FieldName, E>) + Send + Sync>;

pub(super) struct FormState<E> {
    pub(super) initial_values: ValueMap,
    pub(super) values: ValueMap,
    pub(super) errors: BTreeMap<FieldName, E>,
    pub(super) touched: BTreeMap<FieldName, bool>,
    pub(super) has_validated: BTreeSet<FieldName>,
    pub(super) in_flight: BTreeSet<FieldName>,
    pub(super) status: FormStatus,
    pub(super) submitting: bool,
    pub(super) submit_count: u32,
    pub(super) tickets: BTreeMap<FieldName, ValidationTicket>,
    pub(super) versions: BTreeMap<FieldName, u64>,
}

pub struct FormEngine<E>
where
    E: ValidationError,
{
    pub(super) options: FormOptions,
    pub(super) state: Arc<RwLock<FormState<E>>>,
    pub(super) validators: Arc<RwLock<BTreeMap<FieldName, ValidatorChain<E>>>>,
    pub(super) listeners: Arc<RwLock<BTreeMap<FieldName, Vec<ListenerEntry>>>>,
    pub(super) on_error: Option<OnErrorFn<E>>,
    pub(super) ticket_allocator: Arc<AtomicU64>,
    pub(super) subscription_allocator: Arc<AtomicU64>,
}

impl<E> Clone for FormEngine<E>
where
    E: ValidationError,
{
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            state: self.state.clone(),
            validators: self.validators.clone(),
            listeners: self.listeners.clone(),
            on_error: self.on_error.clone(),
            ticket_allocator: self.ticket_allocator.clone(),
            subscription_allocator: self.subscription_allocator.clone(),
        }
    }
}

impl<E> FormEngine<E>
where
    E: ValidationError,
{
    pub fn new(initial_values: ValueMap, options: FormOptions) -> Self {
        Self {
            options,
            state: Arc::new(RwLock::new(FormState {
                values: initial_values.clone(),
                initial_values,
                errors: BTreeMap::new(),
                touched: BTreeMap::new(),
                has_validated: BTreeSet::new(),
                in_flight: BTreeSet::new(),
                status: FormStatus::Idle,
                submitting: false,
                submit_count: 0,
                tickets: BTreeMap::new(),
                versions: BTreeMap::new(),
            })),
            validators: Arc::new(RwLock::new(BTreeMap::new())),
            listeners: Arc::new(RwLock::new(BTreeMap::new())),
            on_error: None,
            ticket_allocator: Arc::new(AtomicU64::new(0)),
            subscription_allocator: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_on_error(
        mut self,
        on_error: impl Fn(&BTreeMap<FieldName, E>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn options(&self) -> FormOptions {
        self.options
    }

    pub async fn set_field_value(
        &self,
        field: impl Into<FieldName>,
        value: Value,
    ) -> FormResult<()> {
        let field = field.into();
        let has_chain = self.has_validator(&field)?;
        let run = {
            let mut state = write_lock(&self.state, "writing field value")?;
            state.values.insert(field.clone(), value);
            if self.options.debug {
                tracing::debug!(field = %field, "field value updated");
            }
            let validated_once = state.has_validated.contains(&field);
            let first = has_chain
                && !validated_once
                && self.options.validate_on == ValidateMode::OnChange;
            let revalidate = has_chain
                && validated_once
                && self.options.revalidate_on == RevalidateMode::OnChange;
            if first {
                state.has_validated.insert(field.clone());
            }
            first || revalidate
        };
        self.notify(&field)?;
        if run {
            let _ = self.validate_field(field).await?;
        }
        Ok(())
    }

    pub async fn set_field_touched(
        &self,
        field: impl Into<FieldName>,
        touched: bool,
    ) -> FormResult<()> {
        let field = field.into();
        let has_chain = self.has_validator(&field)?;
        let run = {
            let mut state = write_lock(&self.state, "writing touched flag")?;
            state.touched.insert(field.clone(), touched);
            if self.options.debug {
                tracing::debug!(field = %field, touched, "touched flag updated");
            }
            let validated_once = state.has_validated.contains(&field);
            let first = touched && has_chain && self.options.validate_on == ValidateMode::OnBlur;
            let revalidate = touched
                && has_chain
                && validated_once
                && self.options.revalidate_on == RevalidateMode::OnBlur;
            if first {
                state.has_validated.insert(field.clone());
            }
            first || revalidate
        };
        self.notify(&field)?;
        if run {
            let _ = self.validate_field(field).await?;
        }
        Ok(())
    }

    pub async fn handle_submit<F, Fut>(&self, handler: F) -> anyhow::Result<()>
    where
        F: FnOnce(ValueMap, FormHelpers<E>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        {
            let mut state = write_lock(&self.state, "starting submit")?;
            transition_status(&mut state, FormStatus::Submitting)?;
            state.submitting = true;
            state.submit_count = state.submit_count.saturating_add(1);
        }

        let valid = match self.validate_form().await {
            Ok(valid) => valid,
            Err(error) => {
                self.finish_submit(FormStatus::Error)?;
                return Err(error.into());
            }
        };
        if !valid {
            let errors = read_lock(&self.state, "reading submit validation errors")?
                .errors
                .clone();
            self.finish_submit(FormStatus::Error)?;
            if let Some(on_error) = &self.on_error {
                on_error(&errors);
            }
            return Ok(());
        }

        let values = read_lock(&self.state, "snapshotting submit values")?
            .values
            .clone();
        let helpers = FormHelpers {
            engine: self.clone(),
        };
        match handler(values, helpers).await {
            Ok(()) => {
                self.finish_submit(FormStatus::Success)?;
                Ok(())
            }
            Err(error) => {
                self.finish_submit(FormStatus::Error)?;
                Err(error)
            }
        }
    }

    fn finish_submit(&self, status: FormStatus) -> FormResult<()> {
        let mut state = write_lock(&self.state, "completing submit")?;
        state.submitting = false;
        // The handler may have reset the form from inside; leave Idle alone.
        if state.status == FormStatus::Idle {
            return Ok(());
        }
        transition_status(&mut state, status)
    }

    pub fn reset_form(&self) -> FormResult<()> {
        let fields: Vec<FieldName> = {
            let mut state = write_lock(&self.state, "resetting form")?;
            let mut fields: BTreeSet<FieldName> = state.values.keys().cloned().collect();
            fields.extend(state.initial_values.keys().cloned());
            state.values = state.initial_values.clone();
            state.errors.clear();
            state.touched.clear();
            state.has_validated.clear();
            state.in_flight.clear();
            state.tickets.clear();
            state.status = FormStatus::Idle;
            state.submitting = false;
            fields.into_iter().collect()
        };
        for field in &fields {
            self.notify(field)?;
        }
        Ok(())
    }

    pub fn reset_field(&self, field: impl Into<FieldName>) -> FormResult<()> {
        let field = field.into();
        {
            let mut state = write_lock(&self.state, "resetting field")?;
            match state.initial_values.get(&field).cloned() {
                Some(value) => {
                    state.values.insert(field.clone(), value);
                }
                None => {
                    state.values.remove(&field);
                }
            }
            state.errors.remove(&field);
            state.touched.remove(&field);
            state.has_validated.remove(&field);
            state.in_flight.remove(&field);
            state.tickets.remove(&field);
        }
        self.notify(&field)
    }

    pub fn clear_errors(&self) -> FormResult<()> {
        let fields: Vec<FieldName> = {
            let mut state = write_lock(&self.state, "clearing all field errors")?;
            let fields = state.errors.keys().cloned().collect();
            state.errors.clear();
            fields
        };
        for field in &fields {
            self.notify(field)?;
        }
        Ok(())
    }

    pub fn clear_field_error(&self, field: impl Into<FieldName>) -> FormResult<()> {
        let field = field.into();
        write_lock(&self.state, "clearing field error")?
            .errors
            .remove(&field);
        self.notify(&field)
    }

    pub fn get_field_props(&self, field: impl Into<FieldName>) -> FormResult<FieldProps> {
        let field = field.into();
        let value = read_lock(&self.state, "reading field value")?
            .values
            .get(&field)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(FieldProps { name: field, value })
    }

    pub fn get_field_meta(&self, field: impl Into<FieldName>) -> FormResult<FieldMeta<E>> {
        let field = field.into();
        let state = read_lock(&self.state, "reading field meta")?;
        Ok(FieldMeta {
            dirty: state.values.get(&field) != state.initial_values.get(&field),
            touched: state.touched.get(&field).copied().unwrap_or(false),
            validating: state.in_flight.contains(&field),
            has_validated: state.has_validated.contains(&field),
            error: state.errors.get(&field).cloned(),
        })
    }

    /// The field's error, but only once the field has been touched.
    pub fn visible_error(&self, field: impl Into<FieldName>) -> FormResult<Option<E>> {
        let field = field.into();
        let state = read_lock(&self.state, "reading visible error")?;
        if state.touched.get(&field).copied().unwrap_or(false) {
            Ok(state.errors.get(&field).cloned())
        } else {
            Ok(None)
        }
    }

    pub fn snapshot(&self) -> FormResult<FormSnapshot<E>> {
        let state = read_lock(&self.state, "creating form snapshot")?;
        Ok(FormSnapshot {
            values: state.values.clone(),
            errors: state.errors.clone(),
            touched: state.touched.clone(),
            status: state.status,
            submit_count: state.submit_count,
            is_dirty: state.values != state.initial_values,
            is_valid: state.errors.is_empty(),
        })
    }

    pub fn values(&self) -> FormResult<ValueMap> {
        Ok(read_lock(&self.state, "reading values")?.values.clone())
    }

    pub fn errors(&self) -> FormResult<BTreeMap<FieldName, E>> {
        Ok(read_lock(&self.state, "reading errors")?.errors.clone())
    }

    pub fn status(&self) -> FormResult<FormStatus> {
        Ok(read_lock(&self.state, "reading status")?.status)
    }

    pub fn is_dirty(&self) -> FormResult<bool> {
        let state = read_lock(&self.state, "reading dirty state")?;
        Ok(state.values != state.initial_values)
    }

    pub fn is_valid(&self) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading validity")?.errors.is_empty())
    }

    pub fn is_validating(&self) -> FormResult<bool> {
        Ok(!read_lock(&self.state, "reading in-flight validations")?
            .in_flight
            .is_empty())
    }

    pub fn is_submitting(&self) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading submitting flag")?.submitting)
    }

    pub fn submit_count(&self) -> FormResult<u32> {
        Ok(read_lock(&self.state, "reading submit count")?.submit_count)
    }

    pub(crate) fn write_field_value(&self, field: &FieldName, value: Value) -> FormResult<()> {
        write_lock(&self.state, "writing field value directly")?
            .values
            .insert(field.clone(), value);
        self.notify(field)
    }

    pub(super) fn next_ticket(&self) -> ValidationTicket {
        ValidationTicket(self.ticket_allocator.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Narrow capability handle passed to the submit handler. All writes are
/// raw: they never trigger validation.
#[derive(Clone)]
pub struct FormHelpers<E>
where
    E: ValidationError,
{
    pub(super) engine: FormEngine<E>,
}

impl<E> FormHelpers<E>
where
    E: ValidationError,
{
    pub fn engine(&self) -> &FormEngine<E> {
        &self.engine
    }

    pub fn set_values(&self, values: ValueMap) -> FormResult<()> {
        let fields: Vec<FieldName> = {
            let mut state = write_lock(&self.engine.state, "replacing value map")?;
            let mut fields: BTreeSet<FieldName> = state.values.keys().cloned().collect();
            fields.extend(values.keys().cloned());
            state.values = values;
            fields.into_iter().collect()
        };
        for field in &fields {
            self.engine.notify(field)?;
        }
        Ok(())
    }

    pub fn set_field_value(&self, field: impl Into<FieldName>, value: Value) -> FormResult<()> {
        self.engine.write_field_value(&field.into(), value)
    }

    pub fn set_errors(&self, errors: BTreeMap<FieldName, E>) -> FormResult<()> {
        let fields: Vec<FieldName> = {
            let mut state = write_lock(&self.engine.state, "replacing error map")?;
            let mut fields: BTreeSet<FieldName> = state.errors.keys().cloned().collect();
            fields.extend(errors.keys().cloned());
            state.errors = errors;
            fields.into_iter().collect()
        };
        for field in &fields {
            self.engine.notify(field)?;
        }
        Ok(())
    }

    pub fn set_field_error(
        &self,
        field: impl Into<FieldName>,
        error: Option<E>,
    ) -> FormResult<()> {
        let field = field.into();
        {
            let mut state = write_lock(&self.engine.state, "writing field error")?;
            match error {
                Some(error) => {
                    state.errors.insert(field.clone(), error);
                }
                None => {
                    state.errors.remove(&field);
                }
            }
        }
        self.engine.notify(&field)
    }

    pub fn set_touched(&self, touched: BTreeMap<FieldName, bool>) -> FormResult<()> {
        let fields: Vec<FieldName> = {
            let mut state = write_lock(&self.engine.state, "replacing touched map")?;
            let mut fields: BTreeSet<FieldName> = state.touched.keys().cloned().collect();
            fields.extend(touched.keys().cloned());
            state.touched = touched;
            fields.into_iter().collect()
        };
        for field in &fields {
            self.engine.notify(field)?;
        }
        Ok(())
    }

    pub fn set_field_touched(&self, field: impl Into<FieldName>, touched: bool) -> FormResult<()> {
        let field = field.into();
        write_lock(&self.engine.state, "writing touched flag directly")?
            .touched
            .insert(field.clone(), touched);
        self.engine.notify(&field)
    }

    pub fn set_submitting(&self, submitting: bool) -> FormResult<()> {
        write_lock(&self.engine.state, "writing submitting flag")?.submitting = submitting;
        Ok(())
    }

    pub fn reset_form(&self) -> FormResult<()> {
        self.engine.reset_form()
    }
}

pub(super) fn transition_status<E>(state: &mut FormState<E>, next: FormStatus) -> FormResult<()> {
    let current = state.status;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (FormStatus::Idle, FormStatus::Submitting)
            | (FormStatus::Submitting, FormStatus::Success)
            | (FormStatus::Submitting, FormStatus::Error)
            | (FormStatus::Success, FormStatus::Submitting)
            | (FormStatus::Error, FormStatus::Submitting)
            | (_, FormStatus::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    state.status = next;
    Ok(())
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
