//! Best-effort shape inference by synthetic forward probing.

use std::panic::{catch_unwind, AssertUnwindSafe};

use burn::{module::Module, tensor::backend::Backend};
use tracing::warn;

use crate::model::{DynLayer, Feature};

/// Infer the output shape a module produces for a per-sample input shape.
///
/// Parameter-free modules are assumed shape-preserving and are not executed
/// at all: running an arbitrary unclassified operation blindly costs more
/// than the approximation. Everything else is probed with a single-sample
/// zero tensor and the resulting shape is returned with the batch dimension
/// stripped.
///
/// This never fails: a probe error returns the input shape unchanged with a
/// logged warning, since the result only feeds the graph display, not
/// training correctness. The probe allocates its own throwaway input and
/// leaves the module untouched, so repeated calls return the same shape.
pub fn infer_output_shape<B: Backend>(
    module: &DynLayer<B>,
    input_shape: &[usize],
    device: &B::Device,
) -> Vec<usize> {
    if module.num_params() == 0 {
        return input_shape.to_vec();
    }

    let probe = match Feature::zeros(input_shape, device) {
        Ok(probe) => probe,
        Err(err) => {
            warn!(error = %err, shape = ?input_shape, "Shape probe could not be constructed");
            return input_shape.to_vec();
        }
    };

    // The tensor backend aborts on shape violations the width checks do not
    // cover, so the probe also guards against unwinds.
    match catch_unwind(AssertUnwindSafe(|| module.forward(probe))) {
        Ok(Ok(output)) => output.shape(),
        Ok(Err(err)) => {
            warn!(
                error = %err,
                module = module.type_tag(),
                shape = ?input_shape,
                "Shape probe failed; assuming identity"
            );
            input_shape.to_vec()
        }
        Err(_) => {
            warn!(
                module = module.type_tag(),
                shape = ?input_shape,
                "Shape probe aborted; assuming identity"
            );
            input_shape.to_vec()
        }
    }
}
