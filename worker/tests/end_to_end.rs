use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf};

use ndarray::{ArrayD, IxDyn, array};
use parameter_server::{Server, ServerConfig};
use worker::{
    CheckpointStatus, DType, Discipline, ExponentialLr, InitializerSpec, JaggedBatch, JaggedPool,
    ModelBuilder, OptimizerSpec, Pooling, Session, SparseTableSpec, TableId, WorkerErr,
};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("worker-e2e-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Starts a reference server on an ephemeral port and returns its address.
async fn start_server(tag: &str) -> SocketAddr {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        checkpoint_dir: temp_dir(tag),
        sparse_shards: NonZeroUsize::new(2).unwrap(),
        seed: Some(7),
    };

    let server = Server::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn dense(values: &[f32]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
}

fn zeros_spec(name: &str, dimension: usize) -> SparseTableSpec {
    SparseTableSpec::new(name, dimension, DType::F32, InitializerSpec::constant(0.0))
}

#[tokio::test]
async fn sync_discipline_applies_and_fetches() {
    let addr = start_server("sync").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("sync")
        .learning_rate(0.5)
        .discipline(Discipline::SyncApplyAndFetch)
        .build(&session)
        .await
        .unwrap();

    let w = model.add_dense("w", dense(&[1.0, 2.0, 3.0])).await.unwrap();
    model.backward(w, dense(&[1.0, 1.0, 2.0])).await.unwrap();

    // sgd without momentum: new = old - lr * grad
    assert_eq!(model.param(w).unwrap().value(), &dense(&[0.5, 1.5, 2.0]));

    model.step().await.unwrap();
    assert_eq!(model.param(w).unwrap().value(), &dense(&[0.5, 1.5, 2.0]));
    assert!(model.param(w).unwrap().grad().is_none());

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn async_discipline_pulls_on_step() {
    let addr = start_server("async").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("async")
        .lr_schedule(ExponentialLr::new(0.5, 0.5))
        .build(&session)
        .await
        .unwrap();

    let a = model.add_dense("a", dense(&[1.0, 2.0])).await.unwrap();
    let b = model.add_dense("b", dense(&[0.0])).await.unwrap();

    model.backward(a, dense(&[2.0, 2.0])).await.unwrap();
    model.backward(b, dense(&[4.0])).await.unwrap();

    // the push doesn't wait for anything, the local value is stale until the step
    assert_eq!(model.param(a).unwrap().value(), &dense(&[1.0, 2.0]));

    model.step().await.unwrap();
    assert_eq!(model.param(a).unwrap().value(), &dense(&[0.0, 1.0]));
    assert_eq!(model.param(b).unwrap().value(), &dense(&[-2.0]));
    assert_eq!(model.lr(), 0.25);

    model.backward(a, dense(&[4.0, 4.0])).await.unwrap();
    model.step().await.unwrap();
    assert_eq!(model.param(a).unwrap().value(), &dense(&[-1.0, 0.0]));

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn existing_dense_table_keeps_server_values() {
    let addr = start_server("existing").await;
    let session = Session::open(addr).await.unwrap();

    let mut first = ModelBuilder::new("shared")
        .learning_rate(1.0)
        .discipline(Discipline::SyncApplyAndFetch)
        .build(&session)
        .await
        .unwrap();

    let w = first.add_dense("w", dense(&[1.0, 1.0])).await.unwrap();
    first.backward(w, dense(&[1.0, 2.0])).await.unwrap();

    let mut second = ModelBuilder::new("shared")
        .learning_rate(1.0)
        .build(&session)
        .await
        .unwrap();
    assert_eq!(second.id(), first.id());

    let w = second.add_dense("w", dense(&[5.0, 5.0])).await.unwrap();
    assert_eq!(second.param(w).unwrap().value(), &dense(&[0.0, -1.0]));

    let result = second.add_dense("w", dense(&[5.0, 5.0])).await;
    assert!(matches!(result, Err(WorkerErr::Registration(_))));

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn registration_errors() {
    let addr = start_server("registration").await;
    let session = Session::open(addr).await.unwrap();

    let result = ModelBuilder::new("bad")
        .optimizer(OptimizerSpec::new("lbfgs"))
        .build(&session)
        .await;
    assert!(matches!(result, Err(WorkerErr::Registration(_))));

    let result = ModelBuilder::new("bad")
        .optimizer(OptimizerSpec::sgd().with("momentum", "fast"))
        .build(&session)
        .await;
    assert!(matches!(result, Err(WorkerErr::Registration(_))));

    let mut first = ModelBuilder::new("conflict").build(&session).await.unwrap();
    first.add_dense("w", dense(&[0.0, 0.0])).await.unwrap();

    let mut second = ModelBuilder::new("conflict").build(&session).await.unwrap();
    let result = second.add_dense("w", dense(&[0.0, 0.0, 0.0])).await;
    assert!(matches!(result, Err(WorkerErr::Registration(_))));

    let spec = SparseTableSpec::new("emb", 4, DType::F32, InitializerSpec::new("orthogonal"));
    let result = second.add_embedding(spec).await;
    assert!(matches!(result, Err(WorkerErr::Registration(_))));

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn sparse_rows_keep_order_and_sum_duplicates() {
    let addr = start_server("sparse").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("sparse")
        .learning_rate(1.0)
        .build(&session)
        .await
        .unwrap();

    let mut embedding = model.add_embedding(zeros_spec("emb", 2)).await.unwrap();

    let rows = embedding.forward(&[3, 5, 3]).await.unwrap();
    assert_eq!(rows, ndarray::Array2::<f32>::zeros((3, 2)));

    let grads = array![[1.0, 1.0], [2.0, 2.0], [10.0, 10.0]];
    embedding.backward(grads.view()).await.unwrap();

    // sparse tables need nothing from the step
    model.step().await.unwrap();

    let rows = embedding.forward(&[5, 3, 3, 9]).await.unwrap();
    assert_eq!(
        rows,
        array![[-2.0, -2.0], [-11.0, -11.0], [-11.0, -11.0], [0.0, 0.0]]
    );

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn backward_retries_after_shape_error() {
    let addr = start_server("retry").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("retry")
        .learning_rate(1.0)
        .build(&session)
        .await
        .unwrap();

    let mut embedding = model.add_embedding(zeros_spec("e", 2)).await.unwrap();
    embedding.forward(&[1, 2]).await.unwrap();

    let result = embedding.backward(array![[1.0, 1.0]].view()).await;
    assert!(matches!(result, Err(WorkerErr::Shape(_))));

    embedding
        .backward(array![[1.0, 1.0], [2.0, 2.0]].view())
        .await
        .unwrap();

    let rows = embedding.forward(&[1, 2]).await.unwrap();
    assert_eq!(rows, array![[-1.0, -1.0], [-2.0, -2.0]]);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn jagged_embedding_pools_and_scatters() {
    let addr = start_server("jagged").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("jagged")
        .learning_rate(1.0)
        .build(&session)
        .await
        .unwrap();

    let spec = SparseTableSpec::new("bags", 2, DType::F32, InitializerSpec::constant(1.0));
    let mut embedding = model
        .add_jagged_embedding(spec, JaggedPool::new(Pooling::Sum, -1.0))
        .await
        .unwrap();

    let batch = JaggedBatch::new(vec![1, 2, 3], vec![0, 2, 2, 3], Some(vec![1.0, 3.0, 2.0])).unwrap();
    let pooled = embedding.forward(&batch).await.unwrap();
    assert_eq!(pooled, array![[4.0, 4.0], [-1.0, -1.0], [2.0, 2.0]]);

    let grad = array![[1.0, 1.0], [5.0, 5.0], [2.0, 2.0]];
    embedding.backward(grad.view()).await.unwrap();

    let rows = embedding.table().pull(&[1, 2, 3]).await.unwrap();
    assert_eq!(rows, array![[0.0, 0.0], [-2.0, -2.0], [-3.0, -3.0]]);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn combine_embedding_batches_members() {
    let addr = start_server("combine").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("combine")
        .learning_rate(1.0)
        .build(&session)
        .await
        .unwrap();

    let specs = vec![
        SparseTableSpec::new("user", 2, DType::F32, InitializerSpec::constant(0.5)),
        zeros_spec("item", 3),
    ];
    let mut embedding = model.add_combine_embedding("features", specs).await.unwrap();
    assert_eq!(embedding.table().len(), 2);

    let rows = embedding.forward(&[vec![1u64, 1], vec![4]]).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], array![[0.5, 0.5], [0.5, 0.5]]);
    assert_eq!(rows[1], array![[0.0, 0.0, 0.0]]);

    let user = array![[0.25, 0.25], [0.25, 0.5]];
    let item = array![[1.0, 2.0, 3.0]];
    embedding.backward(&[user.view(), item.view()]).await.unwrap();

    let rows = embedding.forward(&[vec![1u64], vec![4, 5]]).await.unwrap();
    assert_eq!(rows[0], array![[0.0, -0.25]]);
    assert_eq!(rows[1], array![[-1.0, -2.0, -3.0], [0.0, 0.0, 0.0]]);

    let result = embedding.forward(&[vec![1u64]]).await;
    assert!(matches!(result, Err(WorkerErr::UnsupportedOperation(_))));

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn combine_jagged_embedding_pools_per_member() {
    let addr = start_server("combine-jagged").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("combine-jagged")
        .learning_rate(1.0)
        .build(&session)
        .await
        .unwrap();

    let specs = vec![
        SparseTableSpec::new("a", 1, DType::F32, InitializerSpec::constant(2.0)),
        SparseTableSpec::new("b", 1, DType::F32, InitializerSpec::constant(3.0)),
    ];
    let pools = vec![
        JaggedPool::new(Pooling::Sum, 0.0),
        JaggedPool::new(Pooling::Mean, 9.0),
    ];

    let result = model
        .add_combine_jagged_embedding("bad", specs.clone(), vec![JaggedPool::default()])
        .await;
    assert!(matches!(result, Err(WorkerErr::UnsupportedOperation(_))));

    let mut embedding = model
        .add_combine_jagged_embedding("bags", specs, pools)
        .await
        .unwrap();

    let batches = [
        JaggedBatch::from_groups(&[vec![1u64, 2], vec![3]]),
        JaggedBatch::from_groups(&[vec![1u64, 2, 3, 4], vec![]]),
    ];
    let pooled = embedding.forward(&batches).await.unwrap();
    assert_eq!(pooled[0], array![[4.0], [2.0]]);
    assert_eq!(pooled[1], array![[3.0], [9.0]]);

    let grads = [array![[1.0], [1.0]], array![[4.0], [7.0]]];
    let views: Vec<_> = grads.iter().map(|g| g.view()).collect();
    embedding.backward(&views).await.unwrap();

    let rows = embedding.table().members()[1].pull(&[1, 4, 5]).await.unwrap();
    assert_eq!(rows, array![[2.0], [2.0], [3.0]]);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn failed_push_surfaces_on_next_request() {
    let addr = start_server("deferred").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("deferred").build(&session).await.unwrap();
    let w = model.add_dense("w", dense(&[0.0])).await.unwrap();
    let table = model.table_ids()[0];

    session
        .push_dense(model.id(), TableId(table.0 + 100), &[1.0])
        .await
        .unwrap();

    let result = session.pull_dense(model.id(), table).await;
    assert!(matches!(result, Err(WorkerErr::Remote(_))));

    // only the next request sees the failure
    model.backward(w, dense(&[1.0])).await.unwrap();
    model.step().await.unwrap();

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn failed_push_before_registration_is_remote() {
    let addr = start_server("deferred-registration").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("deferred-registration")
        .build(&session)
        .await
        .unwrap();

    session
        .push_dense(model.id(), TableId(999), &[1.0])
        .await
        .unwrap();

    // the registration never ran, the name stays free
    let result = model.add_dense("v", dense(&[0.0, 0.0])).await;
    match result {
        Err(WorkerErr::Remote(e)) => assert!(e.contains("push_dense"), "{e}"),
        other => panic!("unexpected result {other:?}"),
    }

    let v = model.add_dense("v", dense(&[0.0, 0.0])).await.unwrap();
    assert_eq!(model.param(v).unwrap().value(), &dense(&[0.0, 0.0]));

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn checkpoint_restores_tables() {
    let addr = start_server("checkpoint").await;
    let session = Session::open(addr).await.unwrap();

    let mut model = ModelBuilder::new("checkpoint")
        .learning_rate(1.0)
        .discipline(Discipline::SyncApplyAndFetch)
        .build(&session)
        .await
        .unwrap();

    let w = model.add_dense("w", dense(&[1.0, 1.0])).await.unwrap();
    let mut embedding = model.add_embedding(zeros_spec("emb", 1)).await.unwrap();

    embedding.forward(&[7]).await.unwrap();
    embedding.backward(array![[1.0]].view()).await.unwrap();

    let checkpoint = model.checkpoint();
    assert_eq!(checkpoint.save().await.unwrap(), CheckpointStatus::Done);

    model.backward(w, dense(&[1.0, 1.0])).await.unwrap();
    assert_eq!(model.param(w).unwrap().value(), &dense(&[0.0, 0.0]));
    embedding.forward(&[7]).await.unwrap();
    embedding.backward(array![[1.0]].view()).await.unwrap();

    model.load_blocked().await.unwrap();
    assert_eq!(model.param(w).unwrap().value(), &dense(&[1.0, 1.0]));
    assert_eq!(embedding.forward(&[7]).await.unwrap(), array![[-1.0]]);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn session_lifecycle() {
    let addr = start_server("session").await;
    let session = Session::open(addr).await.unwrap();

    let result = session.connect(addr).await;
    assert!(matches!(result, Err(WorkerErr::Connection(_))));

    let mut model = ModelBuilder::new("lifecycle").build(&session).await.unwrap();
    let w = model.add_dense("w", dense(&[0.0])).await.unwrap();

    session.disconnect().await.unwrap();
    assert!(!session.is_connected().await);

    let result = model.backward(w, dense(&[1.0])).await;
    assert!(matches!(result, Err(WorkerErr::Connection(_))));

    let result = model.step().await;
    assert!(matches!(result, Err(WorkerErr::Connection(_))));

    session.connect(addr).await.unwrap();
    model.step().await.unwrap();
    session.disconnect().await.unwrap();
}
