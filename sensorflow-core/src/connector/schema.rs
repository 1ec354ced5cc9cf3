use super::*;

/// Decodes broker payloads into records.
pub trait DeserializationSchema<T>: Send {
    /// `Ok(None)` drops the payload; `Err` fails the pipeline.
    fn deserialize(&self, payload: &[u8]) -> Result<Option<T>>;
}

/// Encodes records into broker payloads.
pub trait SerializationSchema<T>: Send {
    fn serialize(&self, element: &T) -> Result<Vec<u8>>;

    /// Message key. Records without a key are spread over partitions.
    fn key(&self, _element: &T) -> Option<Vec<u8>> {
        None
    }
}

/// Compact binary codec.
pub struct BincodeSchema<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> BincodeSchema<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for BincodeSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> DeserializationSchema<T> for BincodeSchema<T> {
    fn deserialize(&self, payload: &[u8]) -> Result<Option<T>> {
        bincode::deserialize(payload)
            .map(Some)
            .context("bincode decode failed")
    }
}

impl<T: Serialize> SerializationSchema<T> for BincodeSchema<T> {
    fn serialize(&self, element: &T) -> Result<Vec<u8>> {
        bincode::serialize(element).context("bincode encode failed")
    }
}

/// JSON codec. Strict by default; [`skip_malformed`](Self::skip_malformed)
/// drops undecodable payloads instead of failing.
pub struct JsonSchema<T> {
    skip_malformed: bool,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonSchema<T> {
    pub fn new() -> Self {
        Self {
            skip_malformed: false,
            _phantom: PhantomData,
        }
    }

    pub fn skip_malformed(mut self) -> Self {
        self.skip_malformed = true;
        self
    }
}

impl<T> Default for JsonSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> DeserializationSchema<T> for JsonSchema<T> {
    fn deserialize(&self, payload: &[u8]) -> Result<Option<T>> {
        match serde_json::from_slice(payload) {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.skip_malformed => {
                tracing::warn!(len = payload.len(), "dropping malformed JSON record: {err}");
                Ok(None)
            }
            Err(err) => Err(err).context("JSON decode failed"),
        }
    }
}

impl<T: Serialize> SerializationSchema<T> for JsonSchema<T> {
    fn serialize(&self, element: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(element).context("JSON encode failed")
    }
}

/// Adds a message key to another serialization schema.
pub struct KeyedSchema<S, F> {
    inner: S,
    key_selector: F,
}

impl<S, F> KeyedSchema<S, F> {
    pub fn new(inner: S, key_selector: F) -> Self {
        Self {
            inner,
            key_selector,
        }
    }
}

impl<T, S, F> SerializationSchema<T> for KeyedSchema<S, F>
where
    S: SerializationSchema<T>,
    F: Fn(&T) -> Vec<u8> + Send,
{
    fn serialize(&self, element: &T) -> Result<Vec<u8>> {
        self.inner.serialize(element)
    }

    fn key(&self, element: &T) -> Option<Vec<u8>> {
        Some((self.key_selector)(element))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    fn reading() -> Reading {
        Reading {
            sensor: "s-1".to_string(),
            value: 21.5,
        }
    }

    #[test]
    fn test_bincode_schema_roundtrip() {
        let schema = BincodeSchema::<Reading>::new();
        let bytes = schema.serialize(&reading()).unwrap();
        assert_eq!(schema.deserialize(&bytes).unwrap(), Some(reading()));
        assert!(schema.deserialize(&[0xff]).is_err());
    }

    #[test]
    fn test_json_schema_strict_and_lenient() {
        let strict = JsonSchema::<Reading>::new();
        let bytes = strict.serialize(&reading()).unwrap();
        assert_eq!(strict.deserialize(&bytes).unwrap(), Some(reading()));

        let err = strict.deserialize(b"{not json").unwrap_err();
        assert!(err.to_string().contains("JSON decode failed"));

        let lenient = JsonSchema::<Reading>::new().skip_malformed();
        assert_eq!(lenient.deserialize(b"{not json").unwrap(), None);
    }

    #[test]
    fn test_keyed_schema_adds_key() {
        let schema = KeyedSchema::new(JsonSchema::<Reading>::new(), |r: &Reading| {
            r.sensor.as_bytes().to_vec()
        });
        assert_eq!(schema.key(&reading()), Some(b"s-1".to_vec()));
        assert_eq!(JsonSchema::<Reading>::new().key(&reading()), None);
    }
}
