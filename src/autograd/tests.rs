use super::*;
use approx::assert_abs_diff_eq;
use proptest::prelude::*;

#[test]
fn test_add_backward() {
    let a = Tensor::from_vec(vec![1.0, 2.0], true);
    let b = Tensor::from_vec(vec![3.0, 4.0], true);

    let mut out = add(&a, &b);
    backward(&mut out, None);

    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[1.0, 1.0]));
    assert_eq!(b.grad().unwrap(), ndarray::arr1(&[1.0, 1.0]));
}

#[test]
fn test_sub_backward() {
    let a = Tensor::from_vec(vec![5.0, 1.0], true);
    let b = Tensor::from_vec(vec![2.0, 2.0], true);

    let mut out = sub(&a, &b);
    backward(&mut out, None);

    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[1.0, 1.0]));
    assert_eq!(b.grad().unwrap(), ndarray::arr1(&[-1.0, -1.0]));
}

#[test]
fn test_mul_backward() {
    let a = Tensor::from_vec(vec![2.0, 3.0], true);
    let b = Tensor::from_vec(vec![5.0, 7.0], true);

    let mut out = mul(&a, &b);
    backward(&mut out, None);

    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[5.0, 7.0]));
    assert_eq!(b.grad().unwrap(), ndarray::arr1(&[2.0, 3.0]));
}

#[test]
fn test_square_backward() {
    let a = Tensor::from_vec(vec![3.0, -2.0], true);

    let mut out = square(&a);
    backward(&mut out, None);

    // ∂(a²)/∂a = 2a
    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[6.0, -4.0]));
}

#[test]
fn test_square_of_sub_gradient_counted_once() {
    // d/da of sum((a - b)²) must be exactly 2(a - b)
    let a = Tensor::from_vec(vec![3.0, 1.0], true);
    let b = Tensor::from_vec(vec![1.0, 4.0], false);

    let mut loss = sum(&square(&sub(&a, &b)));
    backward(&mut loss, None);

    let grad = a.grad().unwrap();
    assert_abs_diff_eq!(grad[0], 4.0, epsilon = 1e-6);
    assert_abs_diff_eq!(grad[1], -6.0, epsilon = 1e-6);
}

#[test]
fn test_scale_backward() {
    let a = Tensor::from_vec(vec![1.0, -1.0], true);

    let mut out = scale(&a, 2.5);
    backward(&mut out, None);

    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[2.5, 2.5]));
}

#[test]
fn test_relu_forward_and_backward() {
    let a = Tensor::from_vec(vec![-1.0, 0.0, 2.0], true);

    let mut out = relu(&a);
    assert_eq!(out.data(), &ndarray::arr1(&[0.0, 0.0, 2.0]));

    backward(&mut out, None);
    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[0.0, 0.0, 1.0]));
}

#[test]
fn test_sum_backward_broadcasts() {
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);

    let mut out = sum(&a);
    assert_abs_diff_eq!(out.data()[0], 6.0, epsilon = 1e-6);

    backward(&mut out, Some(ndarray::arr1(&[2.0])));
    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[2.0, 2.0, 2.0]));
}

#[test]
fn test_matmul_forward() {
    // [1 2; 3 4] @ [5; 6] = [17; 39]
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], false);
    let x = Tensor::from_vec(vec![5.0, 6.0], false);

    let out = matmul(&a, &x, 2, 2, 1);
    assert_eq!(out.data(), &ndarray::arr1(&[17.0, 39.0]));
}

#[test]
fn test_matmul_backward() {
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
    let x = Tensor::from_vec(vec![5.0, 6.0], true);

    let mut out = matmul(&a, &x, 2, 2, 1);
    backward(&mut out, Some(ndarray::arr1(&[1.0, 1.0])));

    // ∂L/∂A = g @ xᵀ, ∂L/∂x = Aᵀ @ g
    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[5.0, 6.0, 5.0, 6.0]));
    assert_eq!(x.grad().unwrap(), ndarray::arr1(&[4.0, 6.0]));
}

#[test]
fn test_no_grad_when_disabled() {
    let mut a = Tensor::from_vec(vec![1.0, 2.0], true);
    a.set_requires_grad(false);

    let mut out = square(&a);
    assert!(out.backward_op().is_none());
    backward(&mut out, None);
    assert!(a.grad().is_none());
}

#[test]
fn test_detach_drops_tape() {
    let a = Tensor::from_vec(vec![1.0, 2.0], true);
    let out = square(&a);

    let detached = out.detach();
    assert!(!detached.requires_grad());
    assert!(detached.backward_op().is_none());
    assert_eq!(detached.data(), out.data());
}

#[test]
fn test_clone_shares_grad_cell() {
    let a = Tensor::from_vec(vec![1.0], true);
    let cloned = a.clone();

    cloned.accumulate_grad(ndarray::arr1(&[3.0]));
    assert_eq!(a.grad().unwrap(), ndarray::arr1(&[3.0]));
}

proptest! {
    /// Chained graph d/da sum((a·c − b)²) matches the analytic gradient
    #[test]
    fn prop_chain_gradient_matches_analytic(
        vals in prop::collection::vec(-3.0f32..3.0, 1..16),
        c in 0.1f32..2.0,
    ) {
        let n = vals.len();
        let a = Tensor::from_vec(vals.clone(), true);
        let b = Tensor::from_vec(vec![0.5; n], false);

        let mut loss = sum(&square(&sub(&scale(&a, c), &b)));
        backward(&mut loss, None);

        let grad = a.grad().unwrap();
        for i in 0..n {
            let expected = 2.0 * (c * vals[i] - 0.5) * c;
            prop_assert!(
                (grad[i] - expected).abs() < 1e-4,
                "grad {} != expected {} at {}", grad[i], expected, i
            );
        }
    }
}
