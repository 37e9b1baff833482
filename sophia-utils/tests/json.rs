use serde::{Deserialize, Serialize};
use serde_json::json;
use sophia_utils::*;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Record {
    zeta: Vec<f32>,
    alpha: Option<f64>,
    name: String,
}

#[test]
fn test_jsonify_sorts_nested_keys() {
    let value = json!({
        "b": 1,
        "a": {"y": [ {"d": 1, "c": 2} ], "x": null},
    });
    assert_eq!(
        jsonify(&value).unwrap(),
        r#"{"a":{"x":null,"y":[{"c":2,"d":1}]},"b":1}"#
    );
}

#[test]
fn test_dejsonify_record() {
    let record: Record = dejsonify(r#"{"name":"w","alpha":null,"zeta":[1.5,-2.0]}"#).unwrap();
    assert_eq!(
        record,
        Record {
            zeta: vec![1.5, -2.0],
            alpha: None,
            name: "w".to_string(),
        }
    );
}

#[test]
fn test_compress_obj_round_trip() {
    let record = Record {
        zeta: vec![0.1, 1e-15, f32::MAX, -0.0],
        alpha: Some(0.965),
        name: "exp_avg".to_string(),
    };
    let compressed = compress_obj(&record).unwrap();
    assert!(is_compressed(&compressed));
    let restored: Record = decompress_obj(&compressed).unwrap();
    assert_eq!(restored, record);
}

#[test]
fn test_is_compressed_rejects_plain_json() {
    assert!(!is_compressed(jsonify(&json!({"a": 1})).unwrap().as_bytes()));
    assert!(!is_compressed(&[]));
}

#[test]
fn test_decompress_obj_rejects_garbage() {
    assert!(decompress_obj::<Record>(b"not zlib at all").is_err());
}
