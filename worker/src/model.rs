use std::collections::HashSet;

use comms::specs::{DType, ModelId, OptimizerSpec, SparseTableSpec, TableId};
use log::{debug, info};
use ndarray::ArrayD;

use crate::{
    checkpoint::Checkpoint,
    embedding::{CombineEmbedding, CombineJaggedEmbedding, Embedding, JaggedEmbedding},
    error::{Result, WorkerErr},
    hook::{DenseHook, Discipline, Parameter},
    jagged::JaggedPool,
    lr::{ConstantLr, LrSchedule},
    session::Session,
    tables::{self, CombineTable, DenseTable, SparseTable},
};

const DEFAULT_LR: f32 = 0.01;

/// Configures and registers a `Model`.
pub struct ModelBuilder {
    name: String,
    optimizer: OptimizerSpec,
    lr: Box<dyn LrSchedule>,
    discipline: Discipline,
}

impl ModelBuilder {
    /// Creates a new `ModelBuilder` for a model trained with plain sgd at a constant
    /// learning rate of 0.01 under the async discipline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optimizer: OptimizerSpec::sgd(),
            lr: Box::new(ConstantLr::new(DEFAULT_LR)),
            discipline: Discipline::default(),
        }
    }

    pub fn optimizer(mut self, optimizer: OptimizerSpec) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Uses a constant learning rate.
    pub fn learning_rate(self, lr: f32) -> Self {
        self.lr_schedule(ConstantLr::new(lr))
    }

    pub fn lr_schedule(mut self, schedule: impl LrSchedule + 'static) -> Self {
        self.lr = Box::new(schedule);
        self
    }

    /// How the gradients of dense tables reach the server.
    pub fn discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    /// Registers the model and broadcasts its initial learning rate.
    ///
    /// # Errors
    /// `WorkerErr::Registration` if the server rejects the optimizer,
    /// `WorkerErr::Connection` if the session isn't connected.
    pub async fn build(self, session: &Session) -> Result<Model> {
        let id = session.register_model(&self.name, &self.optimizer).await?;
        session.set_learning_rate(id, self.lr.lr()).await?;

        Ok(Model {
            session: session.clone(),
            id,
            name: self.name,
            lr: self.lr,
            discipline: self.discipline,
            params: Vec::new(),
            names: HashSet::new(),
        })
    }
}

/// Handle to a dense parameter owned by a `Model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

/// Every kind of table a model owns.
#[derive(Debug)]
enum Param {
    Dense { param: Parameter, table: DenseTable },
    Sparse(SparseTable),
    Combine(CombineTable),
}

impl Param {
    fn table_ids(&self) -> Vec<TableId> {
        match self {
            Param::Dense { table, .. } => vec![table.id()],
            Param::Sparse(table) => vec![table.id()],
            Param::Combine(table) => table.table_ids(),
        }
    }

    fn dense(&self) -> Option<(&Parameter, &DenseTable)> {
        match self {
            Param::Dense { param, table } => Some((param, table)),
            _ => None,
        }
    }

    fn dense_mut(&mut self) -> Option<&mut Parameter> {
        match self {
            Param::Dense { param, .. } => Some(param),
            _ => None,
        }
    }
}

/// A registered model: the owner of its tables, their parameters and the learning rate.
///
/// Dense parameters live in the model and are reached through their `ParamId`, embedding
/// layers are handed to the caller.
pub struct Model {
    session: Session,
    id: ModelId,
    name: String,
    lr: Box<dyn LrSchedule>,
    discipline: Discipline,
    params: Vec<Param>,
    names: HashSet<String>,
}

impl Model {
    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// The learning rate of the current step.
    pub fn lr(&self) -> f32 {
        self.lr.lr()
    }

    /// The ids of every table of the model, in registration order.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.params.iter().flat_map(Param::table_ids).collect()
    }

    /// Reserves `names` for a new table, before anything is sent.
    fn claim<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        let mut claimed = Vec::new();

        for name in names {
            if self.names.contains(name) || claimed.iter().any(|c| c == name) {
                return Err(WorkerErr::Registration(format!(
                    "{name} is already registered in model {}",
                    self.name
                )));
            }
            claimed.push(name.to_string());
        }

        Ok(claimed)
    }

    /// Registers a dense `f32` table seeded with `value` and binds a parameter to it.
    pub async fn add_dense(&mut self, name: &str, value: ArrayD<f32>) -> Result<ParamId> {
        self.add_dense_with_dtype(name, value, DType::F32).await
    }

    /// Registers a dense table seeded with `value` and binds a parameter to it.
    ///
    /// The parameter's gradients are routed to the table according to the model's
    /// discipline. The parameter starts with the server's values, which differ from
    /// `value` if the table already existed.
    pub async fn add_dense_with_dtype(
        &mut self,
        name: &str,
        value: ArrayD<f32>,
        dtype: DType,
    ) -> Result<ParamId> {
        let claimed = self.claim([name])?;
        let table = DenseTable::register(&self.session, self.id, name, value.view(), dtype).await?;

        let mut param = Parameter::new(name, value);
        param.assign(table.pull().await?)?;
        param.register_hook(Box::new(DenseHook::new(table.clone(), self.discipline)))?;

        self.names.extend(claimed);
        self.params.push(Param::Dense { param, table });
        Ok(ParamId(self.params.len() - 1))
    }

    /// Registers a sparse table and returns an embedding layer over it.
    pub async fn add_embedding(&mut self, spec: SparseTableSpec) -> Result<Embedding> {
        let table = self.add_sparse(spec).await?;
        Ok(Embedding::new(table))
    }

    /// Registers a sparse table and returns a pooling embedding layer over it.
    pub async fn add_jagged_embedding(
        &mut self,
        spec: SparseTableSpec,
        pool: JaggedPool,
    ) -> Result<JaggedEmbedding> {
        let table = self.add_sparse(spec).await?;
        Ok(JaggedEmbedding::new(table, pool))
    }

    /// Registers a combine table and returns an embedding layer over it.
    pub async fn add_combine_embedding(
        &mut self,
        name: &str,
        specs: Vec<SparseTableSpec>,
    ) -> Result<CombineEmbedding> {
        let table = self.add_combine(name, specs).await?;
        Ok(CombineEmbedding::new(table))
    }

    /// Registers a combine table and returns a pooling embedding layer over it, `pools`
    /// holds the pooling of every member.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if there isn't one pool per member, checked
    /// before anything is registered.
    pub async fn add_combine_jagged_embedding(
        &mut self,
        name: &str,
        specs: Vec<SparseTableSpec>,
        pools: Vec<JaggedPool>,
    ) -> Result<CombineJaggedEmbedding> {
        if pools.len() != specs.len() {
            return Err(WorkerErr::UnsupportedOperation(format!(
                "combine table {name} has {} members but got {} poolings",
                specs.len(),
                pools.len()
            )));
        }

        let table = self.add_combine(name, specs).await?;
        CombineJaggedEmbedding::new(table, pools)
    }

    async fn add_sparse(&mut self, spec: SparseTableSpec) -> Result<SparseTable> {
        let claimed = self.claim([spec.name.as_str()])?;
        let table = SparseTable::register(&self.session, self.id, spec).await?;

        self.names.extend(claimed);
        self.params.push(Param::Sparse(table.clone()));
        Ok(table)
    }

    async fn add_combine(&mut self, name: &str, specs: Vec<SparseTableSpec>) -> Result<CombineTable> {
        let names = std::iter::once(name).chain(specs.iter().map(|s| s.name.as_str()));
        let claimed = self.claim(names)?;
        let table = CombineTable::register(&self.session, self.id, name, specs).await?;

        self.names.extend(claimed);
        self.params.push(Param::Combine(table.clone()));
        Ok(table)
    }

    pub fn param(&self, id: ParamId) -> Option<&Parameter> {
        self.params.get(id.0).and_then(Param::dense).map(|(param, _)| param)
    }

    pub fn param_mut(&mut self, id: ParamId) -> Option<&mut Parameter> {
        self.params.get_mut(id.0).and_then(Param::dense_mut)
    }

    /// Delivers the gradient of a dense parameter, firing its hook.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if `id` isn't a parameter of this model.
    pub async fn backward(&mut self, id: ParamId, grad: ArrayD<f32>) -> Result<()> {
        let name = self.name.clone();
        let param = self.param_mut(id).ok_or_else(|| {
            WorkerErr::UnsupportedOperation(format!("{id:?} is not a parameter of model {name}"))
        })?;

        param.backward(grad).await
    }

    /// Clears the accumulated gradient of every parameter.
    pub fn zero_grad(&mut self) {
        self.params
            .iter_mut()
            .filter_map(Param::dense_mut)
            .for_each(Parameter::zero_grad);
    }

    /// Ends an optimization iteration.
    ///
    /// Under the async discipline the values of every dense table are pulled in a single
    /// round trip, the hooks already pushed the gradients. Sparse tables need nothing, their
    /// rows are pulled by the next forward pass. Afterwards the gradients are cleared and
    /// the learning rate schedule advances and is broadcast again.
    pub async fn step(&mut self) -> Result<()> {
        if self.discipline == Discipline::Async {
            self.pull_dense().await?;
        }

        self.zero_grad();
        self.lr.step();
        self.session.set_learning_rate(self.id, self.lr.lr()).await?;

        debug!(model_id = self.id.0, lr = self.lr.lr(); "step finished");
        Ok(())
    }

    /// Replaces the value of every dense parameter with the server's.
    pub async fn pull_dense(&mut self) -> Result<()> {
        let values = {
            let tables: Vec<&DenseTable> = self
                .params
                .iter()
                .filter_map(Param::dense)
                .map(|(_, table)| table)
                .collect();

            tables::combine_pull(&tables).await?
        };

        let params = self.params.iter_mut().filter_map(Param::dense_mut);
        for (param, value) in params.zip(values) {
            param.assign(value)?;
        }

        Ok(())
    }

    /// The checkpoint coordinator of this model.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.session.clone(), self.id)
    }

    /// Waits for the server to restore the last checkpoint, then refreshes every dense
    /// parameter with the restored values.
    pub async fn load_blocked(&mut self) -> Result<()> {
        self.checkpoint().load_blocked().await?;
        self.pull_dense().await?;
        info!(model_id = self.id.0; "restored model {}", self.name);
        Ok(())
    }
}
