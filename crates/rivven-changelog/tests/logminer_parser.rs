//! LogMiner `SQL_REDO` parsing against statements as LogMiner writes them

#![cfg(feature = "oracle")]

mod harness;

use harness::init_test_logging;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rivven_changelog::common::{Column, ValueNormalizer};
use rivven_changelog::oracle::{Assignments, DmlOperation, LogMinerDmlParser, Scn, ValueToken};
use rivven_changelog::{CdcError, CdcOp, ChangeRecord, RawValue, TableId, TableSchema};
use serde_json::json;

fn table(schema: &str, name: &str, columns: &[(&str, &str)]) -> TableSchema {
    TableSchema::new(
        TableId::new("ORCLPDB1", schema, name),
        columns
            .iter()
            .enumerate()
            .map(|(i, (c, ty))| Column::new(*c, i as u32 + 1, *ty))
            .collect(),
    )
}

fn text_table(schema: &str, name: &str, columns: &[&str]) -> TableSchema {
    let typed: Vec<_> = columns.iter().map(|c| (*c, "VARCHAR2(255)")).collect();
    table(schema, name, &typed)
}

fn customers() -> TableSchema {
    table(
        "DEBEZIUM",
        "CUSTOMERS",
        &[
            ("ID", "NUMBER(10)"),
            ("NAME", "VARCHAR2(50)"),
            ("REGISTERED", "TIMESTAMP(6)"),
            ("BIRTH", "DATE"),
            ("PHOTO", "BLOB"),
        ],
    )
}

fn lit(s: &str) -> Option<RawValue> {
    Some(RawValue::Literal(s.to_string()))
}

fn expr(s: &str) -> Option<RawValue> {
    Some(RawValue::Expression(s.to_string()))
}

#[test]
fn test_insert_with_partial_column_list() {
    init_test_logging();
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"insert into "A"."B"("X","Y") values ('1','Acme')"#,
            &text_table("A", "B", &["X", "Y", "Z"]),
        )
        .unwrap();

    assert_eq!(entry.operation, DmlOperation::Insert);
    assert_eq!(entry.new, vec![lit("1"), lit("Acme"), None]);
}

#[test]
fn test_update_without_where_has_unknown_old_values() {
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"update "A"."B" set "X" = '1';"#,
            &text_table("A", "B", &["X", "Y"]),
        )
        .unwrap();

    assert_eq!(entry.old, vec![None, None]);
    assert_eq!(entry.new, vec![lit("1"), None]);
}

#[test]
fn test_escaped_quotes_are_preserved() {
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"insert into "A"."B"("X") values ('Bob''s dog');"#,
            &text_table("A", "B", &["X"]),
        )
        .unwrap();
    assert_eq!(entry.new, vec![lit("Bob''s dog")]);
}

#[test]
fn test_function_argument_commas_do_not_split_values() {
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"insert into "A"."B"("X","Y") values (FN('a,b'),'2')"#,
            &text_table("A", "B", &["X", "Y"]),
        )
        .unwrap();
    assert_eq!(entry.new, vec![expr("FN('a,b')"), lit("2")]);
}

#[test]
fn test_identifiers_with_spaces_and_hashes() {
    let schema = text_table("DEBEZIUM", "OBJ# 74858", &["COL 1", "COL#2"]);
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"insert into "DEBEZIUM"."OBJ# 74858"("COL 1","COL#2") values ('a','b');"#,
            &schema,
        )
        .unwrap();
    assert_eq!(entry.new, vec![lit("a"), lit("b")]);

    let entry = LogMinerDmlParser::new()
        .parse(
            r#"delete from "DEBEZIUM"."OBJ# 74858" where "COL 1" = 'a' and "COL#2" IS NULL;"#,
            &schema,
        )
        .unwrap();
    assert_eq!(entry.old, vec![lit("a"), None]);
}

#[test]
fn test_insert_with_typed_wrappers() {
    let sql = r#"insert into "DEBEZIUM"."CUSTOMERS"("ID","NAME","REGISTERED","BIRTH","PHOTO") values ('1','Acme',TO_TIMESTAMP('2020-02-01 00:00:00.'),TO_DATE('2020-02-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS'),Unsupported Type);"#;
    let schema = customers();
    let entry = LogMinerDmlParser::new().parse(sql, &schema).unwrap();

    assert_eq!(
        entry.new,
        vec![
            lit("1"),
            lit("Acme"),
            expr("TO_TIMESTAMP('2020-02-01 00:00:00.')"),
            expr("TO_DATE('2020-02-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS')"),
            None,
        ]
    );

    let record = ChangeRecord {
        op: entry.operation.op(),
        op_code: entry.operation.code(),
        table: schema.id.clone(),
        source: "thread-1".to_string(),
        position: Scn::new(1_234_567),
        sequence: 0,
        old: entry.old,
        new: entry.new,
    };
    let event = record
        .to_event("ORCLPDB1", &schema, &ValueNormalizer::new(), 1)
        .unwrap();

    assert_eq!(event.op, CdcOp::Insert);
    assert_eq!(event.source_type, "oracle");
    assert!(event.before.is_none());
    assert_eq!(
        event.after,
        Some(json!({
            "ID": "1",
            "NAME": "Acme",
            "REGISTERED": "2020-02-01T00:00:00",
            "BIRTH": "2020-02-01",
            "PHOTO": null,
        }))
    );
}

#[test]
fn test_update_with_is_null_predicate() {
    let sql = r#"update "DEBEZIUM"."CUSTOMERS" set "NAME" = 'Acme Inc' where "ID" = '1' and "NAME" = 'Acme' and "REGISTERED" IS NULL and "BIRTH" IS NULL and "PHOTO" IS NULL;"#;
    let entry = LogMinerDmlParser::new().parse(sql, &customers()).unwrap();

    assert_eq!(entry.operation, DmlOperation::Update);
    assert_eq!(entry.old, vec![lit("1"), lit("Acme"), None, None, None]);
    assert_eq!(entry.new, vec![lit("1"), lit("Acme Inc"), None, None, None]);
}

#[test]
fn test_update_sets_several_columns() {
    let sql = r#"update "DEBEZIUM"."CUSTOMERS" set "NAME" = NULL, "BIRTH" = TO_DATE('2021-03-04 00:00:00', 'YYYY-MM-DD HH24:MI:SS') where "ID" = '7';"#;
    let entry = LogMinerDmlParser::new().parse(sql, &customers()).unwrap();

    assert_eq!(
        entry.new,
        vec![
            lit("7"),
            None,
            None,
            expr("TO_DATE('2021-03-04 00:00:00', 'YYYY-MM-DD HH24:MI:SS')"),
            None,
        ]
    );
}

#[test]
fn test_delete_with_and_inside_literal() {
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"delete from "A"."B" where "X" = 'salt and pepper' and "Y" = '2';"#,
            &text_table("A", "B", &["X", "Y"]),
        )
        .unwrap();

    assert_eq!(entry.operation, DmlOperation::Delete);
    assert_eq!(entry.old, vec![lit("salt and pepper"), lit("2")]);
    assert!(entry.new.is_empty());
}

#[test]
fn test_where_less_delete() {
    let entry = LogMinerDmlParser::new()
        .parse(r#"delete from "A"."B""#, &text_table("A", "B", &["X", "Y"]))
        .unwrap();
    assert_eq!(entry.old, vec![None, None]);
}

#[test]
fn test_unistr_with_paren_inside_quotes() {
    let schema = table("A", "B", &[("X", "NUMBER"), ("Y", "NVARCHAR2(20)")]);
    let sql = r#"update "A"."B" set "Y" = UNISTR('\0061)\0062') where "X" = '1';"#;

    let statement = LogMinerDmlParser::new().parse_statement(sql).unwrap();
    assert_eq!(
        statement.assignments,
        Assignments::Named(vec![(
            "Y".to_string(),
            ValueToken::Expression(r"UNISTR('\0061)\0062')".to_string())
        )])
    );

    let entry = LogMinerDmlParser::new().parse(sql, &schema).unwrap();
    let value = ValueNormalizer::new()
        .normalize(&schema.columns[1], entry.new[1].as_ref())
        .unwrap();
    assert_eq!(value, json!("a)b"));
}

#[test]
fn test_positional_insert_follows_table_order() {
    let entry = LogMinerDmlParser::new()
        .parse(
            r#"insert into "A"."B" values ('x',2,NULL);"#,
            &text_table("A", "B", &["X", "Y", "Z"]),
        )
        .unwrap();
    assert_eq!(entry.new, vec![lit("x"), expr("2"), None]);
}

#[test]
fn test_malformed_statements() {
    let parser = LogMinerDmlParser::new();
    let schema = text_table("A", "B", &["X", "Y"]);

    for sql in [
        r#"insert into "A"."B"("X","Y") values ('1')"#,
        r#"insert into "A"."B"("X") values ('1') returning"#,
        r#"update "A"."B" set "X" = '1' where"#,
        r#"delete from "A"."B" where "X" = FN('1'"#,
        r#"merge into "A"."B""#,
    ] {
        match parser.parse(sql, &schema) {
            Err(CdcError::UnparsableStatement {
                reason,
                statement,
                position,
            }) => {
                assert!(reason.contains("offset"), "{}", reason);
                assert_eq!(statement, sql);
                assert_eq!(position, None);
            }
            other => panic!("{} parsed as {:?}", sql, other),
        }
    }
}

#[test]
fn test_schema_disagreements() {
    let parser = LogMinerDmlParser::new();
    let schema = text_table("A", "B", &["X", "Y"]);

    for sql in [
        r#"insert into "A"."B" values ('1')"#,
        r#"insert into "A"."B"("Q") values ('1')"#,
        r#"update "A"."C" set "X" = '1'"#,
    ] {
        let err = parser.parse(sql, &schema).unwrap_err();
        assert!(matches!(err, CdcError::SchemaMismatch(_)), "{}: {}", sql, err);
        assert!(!err.is_retriable());
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

proptest! {
    #[test]
    fn prop_insert_subset_round_trip(
        cells in proptest::collection::vec(
            (any::<bool>(), proptest::option::of("[a-zA-Z0-9 ,()'#]{0,12}")),
            6,
        ),
    ) {
        prop_assume!(cells.iter().any(|(listed, _)| *listed));

        let names: Vec<String> = (0..cells.len()).map(|i| format!("C {}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let schema = text_table("S", "T", &name_refs);

        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut expected = vec![None; cells.len()];
        for (i, (listed, value)) in cells.iter().enumerate() {
            if !listed {
                continue;
            }
            columns.push(format!("\"{}\"", names[i]));
            match value {
                Some(v) => {
                    values.push(format!("'{}'", escape(v)));
                    expected[i] = Some(RawValue::Literal(escape(v)));
                }
                None => values.push("NULL".to_string()),
            }
        }
        let sql = format!(
            "insert into \"S\".\"T\"({}) values ({});",
            columns.join(","),
            values.join(",")
        );

        let entry = LogMinerDmlParser::new().parse(&sql, &schema).unwrap();
        prop_assert_eq!(entry.operation, DmlOperation::Insert);
        prop_assert_eq!(entry.new, expected);
    }
}
