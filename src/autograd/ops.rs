//! Autograd operations with backward passes

use super::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Recurse into a tensor's recorded op, if any.
fn propagate(t: &Tensor) {
    if let Some(op) = t.backward_op() {
        op.backward();
    }
}

/// Add two tensors element-wise
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add: length mismatch");
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
            propagate(&self.a);
            propagate(&self.b);
        }
    }
}

/// Subtract two tensors element-wise
pub fn sub(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "sub: length mismatch");
    let data = a.data() - b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(SubBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct SubBackward {
    a: Tensor,
    b: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for SubBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                // ∂L/∂b = -∂L/∂out
                self.b.accumulate_grad(grad * -1.0);
            }
            propagate(&self.a);
            propagate(&self.b);
        }
    }
}

/// Multiply two tensors element-wise
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "mul: length mismatch");
    let data = a.data() * b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(MulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct MulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MulBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * b
                self.a.accumulate_grad(grad * self.b.data());
            }
            if self.b.requires_grad() {
                // ∂L/∂b = ∂L/∂out * a
                self.b.accumulate_grad(grad * self.a.data());
            }
            propagate(&self.a);
            propagate(&self.b);
        }
    }
}

/// Square a tensor element-wise.
///
/// `mul(x, x)` would record `x` as two inputs of one op and traverse (and
/// double-count) the shared subtree twice during backward; a dedicated op
/// visits it once.
pub fn square(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x * x);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(SquareBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct SquareBackward {
    a: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for SquareBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * 2a
                self.a.accumulate_grad(grad * &(self.a.data() * 2.0));
            }
            propagate(&self.a);
        }
    }
}

/// Scale tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * factor
                self.a.accumulate_grad(grad * self.factor);
            }
            propagate(&self.a);
        }
    }
}

/// ReLU activation
pub fn relu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x.max(0.0));
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(ReluBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct ReluBackward {
    a: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for ReluBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * (a > 0)
                let mask = self.a.data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                self.a.accumulate_grad(grad * &mask);
            }
            propagate(&self.a);
        }
    }
}

/// Sum all elements into a length-1 tensor
pub fn sum(a: &Tensor) -> Tensor {
    let data = Array1::from(vec![a.data().sum()]);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(SumBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct SumBackward {
    a: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for SumBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂sum, broadcast to a's shape
                let grad_val = grad[0];
                self.a
                    .accumulate_grad(Array1::from_elem(self.a.len(), grad_val));
            }
            propagate(&self.a);
        }
    }
}

/// Matrix multiplication over flattened row-major matrices
///
/// Computes C = A @ B where A is m×k (length m*k), B is k×n (length k*n)
/// and C is m×n (length m*n).
pub fn matmul(a: &Tensor, b: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    assert_eq!(a.len(), m * k, "matmul: matrix A size mismatch");
    assert_eq!(b.len(), k * n, "matmul: matrix B size mismatch");

    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for p in 0..k {
                acc += a.data()[i * k + p] * b.data()[p * n + j];
            }
            out[i * n + j] = acc;
        }
    }

    let requires_grad = a.requires_grad() || b.requires_grad();
    let mut result = Tensor::new(Array1::from(out), requires_grad);

    if requires_grad {
        result.set_backward_op(Rc::new(MatmulBackward {
            a: a.clone(),
            b: b.clone(),
            m,
            k,
            n,
            result_grad: result.grad_cell(),
        }));
    }

    result
}

struct MatmulBackward {
    a: Tensor,
    b: Tensor,
    m: usize,
    k: usize,
    n: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MatmulBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂A = ∂L/∂C @ Bᵀ
                let mut grad_a = vec![0.0; self.m * self.k];
                for i in 0..self.m {
                    for p in 0..self.k {
                        let mut acc = 0.0;
                        for j in 0..self.n {
                            acc += grad_output[i * self.n + j] * self.b.data()[p * self.n + j];
                        }
                        grad_a[i * self.k + p] = acc;
                    }
                }
                self.a.accumulate_grad(Array1::from(grad_a));
            }

            if self.b.requires_grad() {
                // ∂L/∂B = Aᵀ @ ∂L/∂C
                let mut grad_b = vec![0.0; self.k * self.n];
                for p in 0..self.k {
                    for j in 0..self.n {
                        let mut acc = 0.0;
                        for i in 0..self.m {
                            acc += self.a.data()[i * self.k + p] * grad_output[i * self.n + j];
                        }
                        grad_b[p * self.n + j] = acc;
                    }
                }
                self.b.accumulate_grad(Array1::from(grad_b));
            }

            propagate(&self.a);
            propagate(&self.b);
        }
    }
}
