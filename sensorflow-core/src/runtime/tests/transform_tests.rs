use super::*;

/// Sums its inputs and emits the running total.
#[derive(Default)]
struct RunningSum {
    total: i64,
}

impl Transform<i64, i64> for RunningSum {
    fn process(&mut self, input: i64, output: &mut Vec<i64>) -> Result<()> {
        self.total += input;
        output.push(self.total);
        Ok(())
    }

    fn on_watermark(&mut self, watermark: Watermark, output: &mut Vec<i64>) -> Result<()> {
        output.push(-watermark.timestamp);
        Ok(())
    }

    fn snapshot_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.total)?)
    }

    fn restore_state(&mut self, data: &[u8]) -> Result<()> {
        self.total = bincode::deserialize(data)?;
        Ok(())
    }
}

#[test]
fn test_map_transform_is_one_to_one() {
    let mut transform = MapTransform::new(|x: i32| Ok(x * 2));
    let mut out = Vec::new();
    transform.process(3, &mut out).unwrap();
    transform.process(4, &mut out).unwrap();
    assert_eq!(out, vec![6, 8]);
    assert!(transform.snapshot_state().unwrap().is_empty());
}

#[test]
fn test_map_transform_propagates_errors() {
    let mut transform = MapTransform::new(|x: i32| {
        if x < 0 {
            Err(anyhow!("negative reading {x}"))
        } else {
            Ok(x)
        }
    });
    let mut out = Vec::new();
    let err = transform.process(-1, &mut out).unwrap_err();
    assert_eq!(err.to_string(), "negative reading -1");
    assert!(out.is_empty());
}

#[test]
fn test_boxed_transform_snapshot_and_restore() {
    let mut boxed: Box<dyn Transform<i64, i64>> = Box::new(RunningSum::default());
    let mut out = Vec::new();
    boxed.process(5, &mut out).unwrap();
    boxed.process(7, &mut out).unwrap();
    boxed.on_watermark(Watermark::new(100), &mut out).unwrap();
    assert_eq!(out, vec![5, 12, -100]);

    let snapshot = boxed.snapshot_state().unwrap();
    let mut restored: Box<dyn Transform<i64, i64>> = Box::new(RunningSum::default());
    restored.restore_state(&snapshot).unwrap();
    out.clear();
    restored.process(1, &mut out).unwrap();
    assert_eq!(out, vec![13]);
}
