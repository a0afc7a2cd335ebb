//! Line-protocol serialization.
//!
//! One point per line:
//! `measurement[,tagk=tagv]* field=value[,field=value]*[ timestamp_ns]`.
//! Tags are sorted by key, matching the ingestion endpoint's performance
//! recommendation; fields are sorted by key for deterministic output.

use crate::metrics::point::{FieldValue, Point};

/// Encode one point, without a trailing newline.
pub fn encode_point(point: &Point, buf: &mut String) {
    encode_measurement(&point.measurement, buf);

    for (key, value) in &point.tags {
        buf.push(',');
        encode_key(key, buf);
        buf.push('=');
        encode_key(value, buf);
    }

    buf.push(' ');

    for (i, (key, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }

        encode_key(key, buf);
        buf.push('=');
        encode_field_value(value, buf);
    }

    if let Some(timestamp) = &point.timestamp {
        buf.push(' ');
        buf.push_str(&timestamp.timestamp_nanos_opt().unwrap_or_default().to_string());
    }
}

/// Encode a batch of points, one newline-terminated line per point.
pub fn encode_points<'a>(points: impl IntoIterator<Item = &'a Point>, buf: &mut String) {
    for point in points {
        encode_point(point, buf);
        buf.push('\n');
    }
}

fn encode_measurement(measurement: &str, buf: &mut String) {
    for c in measurement.chars() {
        if c == ',' || c == ' ' {
            buf.push('\\');
        }

        buf.push(c);
    }
}

fn encode_key(key: &str, buf: &mut String) {
    for c in key.chars() {
        if c == ',' || c == '=' || c == ' ' {
            buf.push('\\');
        }

        buf.push(c);
    }
}

fn encode_field_value(value: &FieldValue, buf: &mut String) {
    match value {
        // The default float rendering is the shortest string that parses
        // back to the same value.
        FieldValue::Float(v) => buf.push_str(&v.to_string()),

        FieldValue::Integer(v) => {
            buf.push_str(&v.to_string());
            buf.push('i');
        }

        FieldValue::Unsigned(v) => {
            buf.push_str(&v.to_string());
            buf.push('i');
        }

        FieldValue::Boolean(v) => buf.push_str(if *v { "true" } else { "false" }),

        FieldValue::String(v) => {
            buf.push('"');
            for c in v.chars() {
                if c == '"' {
                    buf.push('\\');
                }
                buf.push(c);
            }
            buf.push('"');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::point::{Fields, Tags};
    use chrono::Utc;

    fn encode(point: &Point) -> String {
        let mut buf = String::new();
        encode_point(point, &mut buf);
        buf
    }

    #[test]
    fn test_encode_point() {
        let p = Point::new("m1", Tags::new(), Fields::from([("a".into(), 1i64.into())]));
        assert_eq!(encode(&p), "m1 a=1i");

        let p = Point::new(
            "m2",
            Tags::new(),
            Fields::from([
                ("a".into(), 123i64.into()),
                ("b".into(), true.into()),
                ("c".into(), "foo".into()),
            ]),
        );
        assert_eq!(encode(&p), "m2 a=123i,b=true,c=\"foo\"");

        let p = Point::new(
            "m3",
            Tags::from([("x".into(), "foo".into())]),
            Fields::from([("a".into(), (-1i64).into())]),
        );
        assert_eq!(encode(&p), "m3,x=foo a=-1i");

        let p = Point::new(
            "m4",
            Tags::from([("x".into(), "1".into()), ("y".into(), "23".into())]),
            Fields::from([("abc".into(), "def".into())]),
        );
        assert_eq!(encode(&p), "m4,x=1,y=23 abc=\"def\"");
    }

    #[test]
    fn test_encode_point_timestamp() {
        let timestamp = Utc::now();
        let p = Point::with_timestamp(
            "m5",
            Tags::new(),
            Fields::from([("a".into(), 1i64.into())]),
            timestamp,
        );

        assert_eq!(
            encode(&p),
            format!("m5 a=1i {}", timestamp.timestamp_nanos_opt().unwrap())
        );
    }

    #[test]
    fn test_encode_point_escaping() {
        let p = Point::new(
            " m, 6 ",
            Tags::from([(", =".into(), "\"\"".into())]),
            Fields::from([("=".into(), "\"a\"".into())]),
        );

        assert_eq!(encode(&p), r#"\ m\,\ 6\ ,\,\ \=="" \=="\"a\"""#);
    }

    #[test]
    fn test_encode_field_types() {
        let p = Point::new(
            "m",
            Tags::new(),
            Fields::from([
                ("f".into(), 1.5f64.into()),
                ("g".into(), 2.0f64.into()),
                ("u".into(), 7u64.into()),
            ]),
        );
        assert_eq!(encode(&p), "m f=1.5,g=2,u=7i");
    }

    #[test]
    fn test_encode_points() {
        let mut buf = String::new();
        encode_points([], &mut buf);
        assert_eq!(buf, "");

        let p1 = Point::new("m1", Tags::new(), Fields::from([("a".into(), 1i64.into())]));
        let mut buf = String::new();
        encode_points([&p1], &mut buf);
        assert_eq!(buf, "m1 a=1i\n");

        let p2 = Point::new(
            "m2",
            Tags::from([("x".into(), "foo".into())]),
            Fields::from([("a".into(), 1i64.into()), ("b".into(), false.into())]),
        );
        let mut buf = String::new();
        encode_points([&p1, &p2], &mut buf);
        assert_eq!(buf, "m1 a=1i\nm2,x=foo a=1i,b=false\n");
    }
}
