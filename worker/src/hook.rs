//! Gradient routing: hooks that forward the gradients of a backward pass to the tables
//! they belong to.

use std::fmt;

use async_trait::async_trait;
use log::debug;
use ndarray::{ArrayD, ArrayView2, ArrayViewD};

use crate::{
    error::{Result, WorkerErr},
    tables::{CombineTable, DenseTable, SparseTable},
};

/// How the gradients of dense tables reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    /// Gradients are sent without waiting, fresh values are pulled once per step.
    #[default]
    Async,
    /// Gradients are applied right away and the updated values come back in the reply.
    SyncApplyAndFetch,
}

/// Called with the gradient of a parameter once per backward pass.
#[async_trait]
pub trait GradHook: Send + Sync {
    /// Handles a freshly computed gradient.
    ///
    /// # Returns
    /// The new value of the parameter, if the hook fetched one.
    async fn on_grad(&self, grad: ArrayViewD<'_, f32>) -> Result<Option<ArrayD<f32>>>;
}

/// Routes the gradient of a dense parameter to its table.
#[derive(Debug, Clone)]
pub struct DenseHook {
    table: DenseTable,
    mode: Discipline,
}

impl DenseHook {
    pub fn new(table: DenseTable, mode: Discipline) -> Self {
        Self { table, mode }
    }

    pub fn table(&self) -> &DenseTable {
        &self.table
    }

    pub fn mode(&self) -> Discipline {
        self.mode
    }
}

#[async_trait]
impl GradHook for DenseHook {
    async fn on_grad(&self, grad: ArrayViewD<'_, f32>) -> Result<Option<ArrayD<f32>>> {
        match self.mode {
            Discipline::Async => {
                self.table.push(grad).await?;
                Ok(None)
            }
            Discipline::SyncApplyAndFetch => self.table.push_pull(grad).await.map(Some),
        }
    }
}

/// Routes the row gradients of an embedding lookup to its sparse table.
#[derive(Debug, Clone)]
pub struct SparseHook {
    table: SparseTable,
}

impl SparseHook {
    pub fn new(table: SparseTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &SparseTable {
        &self.table
    }

    pub async fn on_rows(&self, indices: &[u64], grads: ArrayView2<'_, f32>) -> Result<()> {
        self.table.push(indices, grads).await
    }
}

/// Routes the row gradients of every member of a combine table in one request.
#[derive(Debug, Clone)]
pub struct CombineHook {
    table: CombineTable,
}

impl CombineHook {
    pub fn new(table: CombineTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CombineTable {
        &self.table
    }

    pub async fn on_rows<I: AsRef<[u64]>>(
        &self,
        indices: &[I],
        grads: &[ArrayView2<'_, f32>],
    ) -> Result<()> {
        self.table.push(indices, grads).await
    }
}

/// A trainable tensor: its value, the gradient accumulated since the last reset and at
/// most one hook.
pub struct Parameter {
    name: String,
    value: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
    hook: Option<Box<dyn GradHook>>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("shape", &self.value.shape())
            .field("has_grad", &self.grad.is_some())
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
            hook: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.value
    }

    /// The gradient accumulated since the last `zero_grad`.
    pub fn grad(&self) -> Option<&ArrayD<f32>> {
        self.grad.as_ref()
    }

    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Binds `hook` to this parameter.
    ///
    /// # Errors
    /// `WorkerErr::Registration` if a hook is already bound.
    pub fn register_hook(&mut self, hook: Box<dyn GradHook>) -> Result<()> {
        if self.hook.is_some() {
            return Err(WorkerErr::Registration(format!(
                "parameter {} already has a gradient hook",
                self.name
            )));
        }

        self.hook = Some(hook);
        Ok(())
    }

    /// Delivers the gradient of a backward pass.
    ///
    /// The gradient is accumulated locally and handed to the hook, a value returned by the
    /// hook replaces the parameter's value.
    ///
    /// # Errors
    /// `WorkerErr::Shape` if `grad` doesn't have the parameter's shape, any error of the hook.
    pub async fn backward(&mut self, grad: ArrayD<f32>) -> Result<()> {
        if grad.shape() != self.value.shape() {
            return Err(WorkerErr::Shape(format!(
                "gradient of shape {:?} for parameter {} of shape {:?}",
                grad.shape(),
                self.name,
                self.value.shape()
            )));
        }

        let updated = match &self.hook {
            Some(hook) => hook.on_grad(grad.view()).await?,
            None => None,
        };

        if let Some(value) = updated {
            self.assign(value)?;
            debug!(parameter = self.name.as_str(); "value replaced by gradient hook");
        }

        match &mut self.grad {
            Some(acc) => *acc += &grad,
            None => self.grad = Some(grad),
        }

        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Replaces the value with one fetched from the server.
    pub(crate) fn assign(&mut self, value: ArrayD<f32>) -> Result<()> {
        if value.shape() != self.value.shape() {
            return Err(WorkerErr::Protocol(format!(
                "got a value of shape {:?} for parameter {} of shape {:?}",
                value.shape(),
                self.name,
                self.value.shape()
            )));
        }

        self.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use ndarray::IxDyn;

    use super::*;

    /// Counts its calls and answers with a fixed value.
    struct Fixed {
        calls: Arc<AtomicUsize>,
        value: Option<ArrayD<f32>>,
    }

    #[async_trait]
    impl GradHook for Fixed {
        async fn on_grad(&self, _grad: ArrayViewD<'_, f32>) -> Result<Option<ArrayD<f32>>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.value.clone())
        }
    }

    fn zeros(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::zeros(IxDyn(shape))
    }

    #[test]
    fn at_most_one_hook() {
        let mut param = Parameter::new("w", zeros(&[2]));
        let calls = Arc::new(AtomicUsize::new(0));

        let hook = Fixed {
            calls: Arc::clone(&calls),
            value: None,
        };
        param.register_hook(Box::new(hook)).unwrap();

        let hook = Fixed { calls, value: None };
        let result = param.register_hook(Box::new(hook));
        assert!(matches!(result, Err(WorkerErr::Registration(_))));
    }

    #[tokio::test]
    async fn backward_fires_hook_once_and_accumulates() {
        let mut param = Parameter::new("w", zeros(&[2]));
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = Fixed {
            calls: Arc::clone(&calls),
            value: None,
        };
        param.register_hook(Box::new(hook)).unwrap();

        let grad = ArrayD::from_elem(IxDyn(&[2]), 1.5);
        param.backward(grad.clone()).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        param.backward(grad).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(param.grad(), Some(&ArrayD::from_elem(IxDyn(&[2]), 3.0)));
        assert_eq!(param.value(), &zeros(&[2]));

        param.zero_grad();
        assert!(param.grad().is_none());
    }

    #[tokio::test]
    async fn fetched_value_replaces_parameter() {
        let mut param = Parameter::new("w", zeros(&[2]));
        let fetched = ArrayD::from_elem(IxDyn(&[2]), 7.0);
        let hook = Fixed {
            calls: Arc::new(AtomicUsize::new(0)),
            value: Some(fetched.clone()),
        };
        param.register_hook(Box::new(hook)).unwrap();

        param.backward(zeros(&[2])).await.unwrap();
        assert_eq!(param.value(), &fetched);
    }

    #[tokio::test]
    async fn gradient_shape_is_checked() {
        let mut param = Parameter::new("w", zeros(&[2, 2]));

        let result = param.backward(zeros(&[4])).await;
        assert!(matches!(result, Err(WorkerErr::Shape(_))));
    }

    #[tokio::test]
    async fn fetched_value_of_wrong_shape_is_a_protocol_error() {
        let mut param = Parameter::new("w", zeros(&[2]));
        let hook = Fixed {
            calls: Arc::new(AtomicUsize::new(0)),
            value: Some(zeros(&[3])),
        };
        param.register_hook(Box::new(hook)).unwrap();

        let result = param.backward(zeros(&[2])).await;
        assert!(matches!(result, Err(WorkerErr::Protocol(_))));
    }
}
