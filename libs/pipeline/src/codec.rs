use std::sync::Arc;

use streamfold_api::{ClickEvent, Codec, DecodeError, DomainRecord, RecordKind, WeatherReading};

/// Codec для выбранного вида записей.
pub fn codec_for(kind: RecordKind) -> Arc<dyn Codec> {
    match kind {
        RecordKind::Weather => Arc::new(WeatherCodec),
        RecordKind::Click => Arc::new(ClickCodec),
    }
}

fn as_text(bytes: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(bytes).map_err(|_| DecodeError::Utf8)
}

// ═══════════════════════════════════════════════════════════════
//  Weather
// ═══════════════════════════════════════════════════════════════

/// `station,temperature,humidity` — ровно три поля через запятую.
pub struct WeatherCodec;

impl WeatherCodec {
    fn number(field: &'static str, raw: &str) -> Result<f64, DecodeError> {
        let invalid = || DecodeError::InvalidNumber {
            field,
            value: raw.to_string(),
        };
        let value: f64 = raw.parse().map_err(|_| invalid())?;
        // "NaN"/"inf" парсятся как f64, но ломают суммы агрегата.
        if !value.is_finite() {
            return Err(invalid());
        }
        Ok(value)
    }
}

impl Codec for WeatherCodec {
    fn kind(&self) -> RecordKind {
        RecordKind::Weather
    }

    fn decode(&self, bytes: &[u8]) -> Result<DomainRecord, DecodeError> {
        let text = as_text(bytes)?.trim();
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(DecodeError::FieldCount {
                expected: 3,
                found: fields.len(),
            });
        }
        if fields[0].is_empty() {
            return Err(DecodeError::EmptyField("station"));
        }

        Ok(DomainRecord::Weather(WeatherReading {
            station: fields[0].to_string(),
            temperature: Self::number("temperature", fields[1])?,
            humidity: Self::number("humidity", fields[2])?,
        }))
    }

    fn encode(&self, record: &DomainRecord) -> Result<Vec<u8>, DecodeError> {
        match record {
            DomainRecord::Weather(r) => {
                Ok(format!("{},{},{}", r.station, r.temperature, r.humidity).into_bytes())
            }
            _ => Err(DecodeError::VariantMismatch(RecordKind::Weather)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Click
// ═══════════════════════════════════════════════════════════════

/// Один идентификатор пользователя на запись.
pub struct ClickCodec;

impl Codec for ClickCodec {
    fn kind(&self) -> RecordKind {
        RecordKind::Click
    }

    fn decode(&self, bytes: &[u8]) -> Result<DomainRecord, DecodeError> {
        let user_id = as_text(bytes)?.trim();
        if user_id.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(DomainRecord::Click(ClickEvent {
            user_id: user_id.to_string(),
        }))
    }

    fn encode(&self, record: &DomainRecord) -> Result<Vec<u8>, DecodeError> {
        match record {
            DomainRecord::Click(c) => Ok(c.user_id.clone().into_bytes()),
            _ => Err(DecodeError::VariantMismatch(RecordKind::Click)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather(station: &str, temperature: f64, humidity: f64) -> DomainRecord {
        DomainRecord::Weather(WeatherReading {
            station: station.into(),
            temperature,
            humidity,
        })
    }

    #[test]
    fn weather_decodes_trimmed_fields() {
        let rec = WeatherCodec.decode(b" StationA , 35.0 ,60 \n").unwrap();
        assert_eq!(rec, weather("StationA", 35.0, 60.0));
        assert_eq!(rec.natural_key(), "StationA");
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let samples = [
            weather("StationA", 35.0, 60.0),
            weather("north-7", -12.25, 99.5),
            weather("X", 0.1, 0.0),
        ];
        for rec in samples {
            let bytes = WeatherCodec.encode(&rec).unwrap();
            assert_eq!(WeatherCodec.decode(&bytes).unwrap(), rec);
        }

        let click = DomainRecord::Click(ClickEvent { user_id: "user1".into() });
        let bytes = ClickCodec.encode(&click).unwrap();
        assert_eq!(ClickCodec.decode(&bytes).unwrap(), click);
    }

    #[test]
    fn weather_rejects_malformed_input() {
        let cases: &[&[u8]] = &[
            b"",
            b"   ",
            b"StationC,notanumber",
            b"StationC,1.0,2.0,3.0",
            b"StationC,abc,2.0",
            b"StationC,1.0,",
            b",1.0,2.0",
            b"StationC,NaN,2.0",
            b"StationC,1.0,inf",
            &[0xff, 0xfe, b',', b'1', b',', b'2'],
        ];
        for input in cases {
            assert!(WeatherCodec.decode(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn scenario_three_is_a_field_count_error() {
        let err = WeatherCodec.decode(b"StationC,notanumber").unwrap_err();
        assert!(matches!(err, DecodeError::FieldCount { expected: 3, found: 2 }));
    }

    #[test]
    fn click_rejects_empty_id() {
        assert!(matches!(ClickCodec.decode(b" \r\n"), Err(DecodeError::Empty)));
        assert!(matches!(ClickCodec.decode(&[0xc3, 0x28]), Err(DecodeError::Utf8)));
    }

    #[test]
    fn encode_rejects_other_variant() {
        let click = DomainRecord::Click(ClickEvent { user_id: "u".into() });
        assert!(matches!(
            WeatherCodec.encode(&click),
            Err(DecodeError::VariantMismatch(RecordKind::Weather))
        ));
        assert!(ClickCodec.encode(&weather("s", 1.0, 1.0)).is_err());
    }

    #[test]
    fn codec_for_matches_kind() {
        assert_eq!(codec_for(RecordKind::Weather).kind(), RecordKind::Weather);
        assert_eq!(codec_for(RecordKind::Click).kind(), RecordKind::Click);
    }
}
