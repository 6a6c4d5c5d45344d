use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use worker::{JaggedPool, Offsets, Pooling};

const DIM: usize = 5;
const EPS: f32 = 1e-4;

fn random_lengths(rng: &mut StdRng) -> Vec<usize> {
    let groups = rng.random_range(1..12);
    (0..groups).map(|_| rng.random_range(0..6)).collect()
}

fn random_matrix(rng: &mut StdRng, rows: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, DIM), |_| rng.random_range(-1.0..1.0))
}

fn dot(a: ArrayView2<f32>, b: ArrayView2<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// The scatter of the backward pass is the transpose of the pooling, so for every pair of
/// inputs `<forward(v), g> == <v, backward(g)>`.
#[test]
fn backward_is_adjoint_of_forward() {
    let mut rng = StdRng::seed_from_u64(42);

    for mode in [Pooling::Sum, Pooling::Mean] {
        let pool = JaggedPool::new(mode, 0.0);

        for _ in 0..50 {
            let offsets = Offsets::from_lengths(&random_lengths(&mut rng));
            let rows = offsets.rows();

            let weights: Option<Vec<f32>> = rng
                .random_bool(0.5)
                .then(|| (0..rows).map(|_| rng.random_range(0.0..2.0)).collect());

            let values = random_matrix(&mut rng, rows);
            let grad = random_matrix(&mut rng, offsets.groups());

            let pooled = pool
                .forward(values.view(), &offsets, weights.as_deref())
                .unwrap();
            let scattered = pool
                .backward(grad.view(), &offsets, weights.as_deref())
                .unwrap();

            assert_eq!(pooled.dim(), (offsets.groups(), DIM));
            assert_eq!(scattered.dim(), (rows, DIM));

            let lhs = dot(pooled.view(), grad.view());
            let rhs = dot(values.view(), scattered.view());
            assert!((lhs - rhs).abs() < EPS, "{mode}: {lhs} != {rhs}");
        }
    }
}

#[test]
fn mean_is_sum_over_group_length() {
    let mut rng = StdRng::seed_from_u64(7);
    let sum = JaggedPool::new(Pooling::Sum, 3.0);
    let mean = JaggedPool::new(Pooling::Mean, 3.0);

    for _ in 0..50 {
        let lengths = random_lengths(&mut rng);
        let offsets = Offsets::from_lengths(&lengths);
        let values = random_matrix(&mut rng, offsets.rows());

        let summed = sum.forward(values.view(), &offsets, None).unwrap();
        let averaged = mean.forward(values.view(), &offsets, None).unwrap();

        for (group, &len) in lengths.iter().enumerate() {
            for j in 0..DIM {
                let (s, m) = (summed[[group, j]], averaged[[group, j]]);

                if len == 0 {
                    assert_eq!(s, 3.0);
                    assert_eq!(m, 3.0);
                } else {
                    assert!((s / len as f32 - m).abs() < EPS);
                }
            }
        }
    }
}
