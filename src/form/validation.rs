use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures_timer::Delay;

use super::engine::{
    FieldName, FormEngine, FormResult, ValidationTicket, Value, ValueMap, read_lock, write_lock,
};

pub trait ValidationError: Clone + Send + Sync + 'static {
    fn message(&self) -> &str;
}

impl ValidationError for String {
    fn message(&self) -> &str {
        self
    }
}

pub(super) type SyncValidatorFn<E> =
    Arc<dyn Fn(&Value, &ValueMap) -> Result<(), E> + Send + Sync>;
pub(super) type AsyncValidatorFn<E> =
    Arc<dyn Fn(Value, ValueMap) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// One step of a field's validator chain. `Err(E)` is the error-message
/// channel: a fallible validator maps its internal failures into `E` instead
/// of propagating them to the engine.
#[derive(Clone)]
pub enum FieldValidator<E> {
    Sync(SyncValidatorFn<E>),
    Async(AsyncValidatorFn<E>),
}

impl<E> FieldValidator<E>
where
    E: ValidationError,
{
    pub fn sync(f: impl Fn(&Value, &ValueMap) -> Result<(), E> + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ValueMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Self::Async(Arc::new(move |value, values| Box::pin(f(value, values))))
    }
}

#[derive(Clone)]
pub(super) struct ValidatorChain<E> {
    pub(super) debounce: Duration,
    pub(super) validators: Vec<FieldValidator<E>>,
}

impl<E> Default for ValidatorChain<E> {
    fn default() -> Self {
        Self {
            debounce: Duration::ZERO,
            validators: Vec::new(),
        }
    }
}

/// Runs a chain strictly in declared order; the first failure wins and the
/// remaining validators are not invoked.
pub(super) async fn run_validators<E>(
    validators: &[FieldValidator<E>],
    value: &Value,
    values: &ValueMap,
) -> Result<(), E>
where
    E: ValidationError,
{
    for validator in validators {
        match validator {
            FieldValidator::Sync(f) => f(value, values)?,
            FieldValidator::Async(f) => f(value.clone(), values.clone()).await?,
        }
    }
    Ok(())
}

impl<E> FormEngine<E>
where
    E: ValidationError,
{
    /// Installs a field-to-chain mapping at construction time. The engine
    /// was just built, so the validator lock cannot be poisoned yet.
    pub fn with_validation_schema(
        self,
        schema: impl IntoIterator<Item = (FieldName, Vec<FieldValidator<E>>)>,
    ) -> Self {
        for (field, validators) in schema {
            let _ = self.register_validator_chain(field, validators);
        }
        self
    }

    pub fn register_validator(
        &self,
        field: impl Into<FieldName>,
        validator: FieldValidator<E>,
    ) -> FormResult<()> {
        self.register_validator_chain(field, vec![validator])
    }

    pub fn register_validator_chain(
        &self,
        field: impl Into<FieldName>,
        validators: Vec<FieldValidator<E>>,
    ) -> FormResult<()> {
        let mut chains = write_lock(&self.validators, "registering validator chain")?;
        chains
            .entry(field.into())
            .or_default()
            .validators
            .extend(validators);
        Ok(())
    }

    pub fn register_validator_chain_with_debounce(
        &self,
        field: impl Into<FieldName>,
        debounce_ms: u64,
        validators: Vec<FieldValidator<E>>,
    ) -> FormResult<()> {
        let mut chains = write_lock(&self.validators, "registering debounced chain")?;
        let entry = chains.entry(field.into()).or_default();
        entry.debounce = Duration::from_millis(debounce_ms);
        entry.validators.extend(validators);
        Ok(())
    }

    pub(super) fn has_validator(&self, field: &FieldName) -> FormResult<bool> {
        Ok(read_lock(&self.validators, "checking for validator")?
            .get(field)
            .is_some_and(|chain| !chain.validators.is_empty()))
    }

    pub async fn validate_field(&self, field: impl Into<FieldName>) -> FormResult<Option<E>> {
        let field = field.into();
        let chain = {
            read_lock(&self.validators, "reading validator chain")?
                .get(&field)
                .cloned()
        };
        let Some(chain) = chain else {
            return Ok(None);
        };

        let (ticket, value, values) = {
            let mut state = write_lock(&self.state, "starting field validation")?;
            let ticket = self.next_ticket();
            state.tickets.insert(field.clone(), ticket);
            state.in_flight.insert(field.clone());
            let value = state.values.get(&field).cloned().unwrap_or(Value::Null);
            (ticket, value, state.values.clone())
        };

        if !chain.debounce.is_zero() {
            Delay::new(chain.debounce).await;
            if !self.is_latest_ticket(&field, ticket)? {
                return Ok(None);
            }
        }

        let result = run_validators(&chain.validators, &value, &values).await;
        self.finish_validation(&field, ticket, result)
    }

    /// Runs every registered chain concurrently and overwrites the error map
    /// in one atomic write once all of them have resolved.
    pub async fn validate_form(&self) -> FormResult<bool> {
        let chains = read_lock(&self.validators, "reading validators for form validation")?.clone();
        let values = {
            let mut state = write_lock(&self.state, "preparing form validation")?;
            for field in chains.keys() {
                let ticket = self.next_ticket();
                state.tickets.insert(field.clone(), ticket);
                state.in_flight.insert(field.clone());
            }
            state.values.clone()
        };

        let runs = chains.iter().map(|(field, chain)| {
            let value = values.get(field).cloned().unwrap_or(Value::Null);
            let values = values.clone();
            async move {
                let result = run_validators(&chain.validators, &value, &values).await;
                (field.clone(), result.err())
            }
        });
        let results = futures::future::join_all(runs).await;

        let mut errors = BTreeMap::new();
        for (field, error) in results {
            if let Some(error) = error {
                errors.insert(field, error);
            }
        }

        let changed: Vec<FieldName> = {
            let mut state = write_lock(&self.state, "applying form validation result")?;
            for field in chains.keys() {
                state.in_flight.remove(field);
                state.has_validated.insert(field.clone());
            }
            let mut changed: BTreeSet<FieldName> = state.errors.keys().cloned().collect();
            changed.extend(errors.keys().cloned());
            state.errors = errors;
            changed.into_iter().collect()
        };
        for field in &changed {
            self.notify(field)?;
        }
        self.is_valid()
    }

    fn is_latest_ticket(&self, field: &FieldName, ticket: ValidationTicket) -> FormResult<bool> {
        Ok(read_lock(&self.state, "checking latest validation ticket")?
            .tickets
            .get(field)
            .copied()
            == Some(ticket))
    }

    fn finish_validation(
        &self,
        field: &FieldName,
        ticket: ValidationTicket,
        result: Result<(), E>,
    ) -> FormResult<Option<E>> {
        let error = result.err();
        let stale = {
            let mut state = write_lock(&self.state, "finishing field validation")?;
            if state.tickets.get(field).copied() != Some(ticket) {
                // Superseded or reset; the newer run owns the bookkeeping.
                true
            } else {
                state.in_flight.remove(field);
                match &error {
                    Some(err) => {
                        state.errors.insert(field.clone(), err.clone());
                    }
                    None => {
                        state.errors.remove(field);
                    }
                }
                false
            }
        };
        if !stale {
            self.notify(field)?;
        }
        Ok(error)
    }
}
