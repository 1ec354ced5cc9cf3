use super::*;

/// The analytics stage between source and sink.
///
/// Runs on the operator task, one record at a time and in arrival order.
/// Outputs pushed to `output` inherit the input record's event time.
pub trait Transform<IN, OUT>: Send {
    fn process(&mut self, input: IN, output: &mut Vec<OUT>) -> Result<()>;

    /// Event time advanced to `watermark`. Outputs carry the watermark's
    /// timestamp.
    fn on_watermark(&mut self, _watermark: Watermark, _output: &mut Vec<OUT>) -> Result<()> {
        Ok(())
    }

    /// Stateless transforms keep the empty default.
    fn snapshot_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore_state(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Stateless one-to-one transform from a closure.
pub struct MapTransform<F, IN> {
    f: F,
    _phantom: std::marker::PhantomData<fn(IN)>,
}

impl<F, IN> MapTransform<F, IN> {
    pub fn new<OUT>(f: F) -> Self
    where
        F: FnMut(IN) -> Result<OUT> + Send,
    {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<F, IN, OUT> Transform<IN, OUT> for MapTransform<F, IN>
where
    F: FnMut(IN) -> Result<OUT> + Send,
{
    fn process(&mut self, input: IN, output: &mut Vec<OUT>) -> Result<()> {
        output.push((self.f)(input)?);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transform_tests.rs"]
mod tests;
