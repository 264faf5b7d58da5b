//! Binary wiring: environment snapshot, endpoint registrations, start.
//!
//! The endpoint set mirrors a small back-office catalog (categories,
//! expenses, document blobs) running against stored procedures reached
//! through the `Database` seam. Swap `UnconfiguredDatabase` for a real
//! driver implementation to bring the catalog to life.

use apiserver::db::UnconfiguredDatabase;
use apiserver::{logging, util, Config, Database, FieldType, HandlerError, InputRule, Server};
use http::Method;
use std::path::Path;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    logging::init();
    let config = Config::from_env();
    let blob_path = config.blob_path.clone();
    let database = Arc::new(UnconfiguredDatabase);
    let mut server = Server::new(config, database.clone(), database.clone());

    let db = database.clone();
    server.register_webapi(
        "/api/shippers/view",
        "List of shipping companies",
        Method::GET,
        vec![],
        vec![],
        true,
        move |req| {
            let json = db.get_json_response("DB1", "sp_shippers_view")?;
            req.response.set_body(&json, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/customer/search",
        "Find customers by company's name",
        Method::POST,
        vec![InputRule::new("filter", FieldType::String, true)],
        vec!["sysadmin".into(), "customer_info".into()],
        true,
        move |req| {
            let sql = req.get_sql("sp_customers_like $filter");
            req.response
                .set_body(&db.get_json_response("DB1", &sql)?, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/categ/view",
        "List of expense categories",
        Method::GET,
        vec![],
        vec![],
        true,
        move |req| {
            req.response
                .set_body(&db.get_json_response("DB1", "sp_categ_view")?, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/categ/get",
        "Retrieve category record",
        Method::GET,
        vec![InputRule::new("id", FieldType::Integer, true)],
        vec![],
        true,
        move |req| {
            let sql = req.get_sql("sp_categ_get $id");
            req.response
                .set_body(&db.get_json_response("DB1", &sql)?, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/categ/add",
        "Add category record",
        Method::POST,
        vec![InputRule::new("descrip", FieldType::String, true)],
        vec![],
        true,
        move |req| {
            db.exec_sql("DB1", &req.get_sql("sp_categ_add $descrip"))?;
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/categ/update",
        "Update category record",
        Method::POST,
        vec![
            InputRule::new("categ_id", FieldType::Integer, true),
            InputRule::new("descrip", FieldType::String, true),
        ],
        vec!["can_update".into()],
        true,
        move |req| {
            db.exec_sql("DB1", &req.get_sql("sp_categ_update $categ_id, $descrip"))?;
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/categ/delete",
        "Delete category record",
        Method::GET,
        vec![InputRule::new("id", FieldType::Integer, true)],
        vec!["can_delete".into()],
        true,
        move |req| {
            // referential integrity gate
            let in_use = db.has_rows("DB1", &req.get_sql("sp_categ_in_use $id"))?;
            req.enforce_that("validator_ref_integrity", "err.delete", || !in_use)?;
            db.exec_sql("DB1", &req.get_sql("sp_categ_delete $id"))?;
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/gasto/add",
        "Add expense record",
        Method::POST,
        vec![
            InputRule::new("fecha", FieldType::Date, true),
            InputRule::new("categ_id", FieldType::Integer, true),
            InputRule::new("monto", FieldType::Double, true),
            InputRule::new("motivo", FieldType::String, true),
        ],
        vec![],
        true,
        move |req| {
            req.enforce_that("validator_today", "err.invaliddate", || {
                req.get_param("fecha") <= util::today().as_str()
            })?;
            db.exec_sql("DB1", &req.get_sql("sp_gasto_insert $fecha, $categ_id, $monto, $motivo"))?;
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    server.register_webapi(
        "/api/blob/add",
        "Upload document and register it in the database",
        Method::POST,
        vec![
            InputRule::new("title", FieldType::String, true),
            InputRule::new("document", FieldType::String, true),
            InputRule::new("filename", FieldType::String, true),
            InputRule::new("content_type", FieldType::String, true),
            InputRule::new("content_len", FieldType::Integer, true),
        ],
        vec!["general".into(), "sysadmin".into()],
        true,
        move |req| {
            db.exec_sql(
                "DB1",
                &req.get_sql("sp_blob_add $title, $document, $filename, $content_type, $content_len"),
            )?;
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );

    let db = database.clone();
    let blobs = blob_path.clone();
    server.register_webapi(
        "/api/blob/download",
        "Download the file associated with a document",
        Method::GET,
        vec![InputRule::new("id", FieldType::Integer, true)],
        vec![],
        true,
        move |req| {
            let rec = db.get_record("DB1", &req.get_sql("sp_blob_get $id"))?;
            if rec.is_empty() {
                return Err(HandlerError::ResourceNotFound(format!(
                    "blob ID {}",
                    req.get_param("id")
                )));
            }
            let document = rec.get("document").cloned().unwrap_or_default();
            let filename = rec.get("filename").cloned().unwrap_or_default();
            let content_type = rec.get("content_type").cloned().unwrap_or_default();
            match std::fs::read(Path::new(&blobs).join(&document)) {
                Ok(bytes) => {
                    req.response
                        .set_content_disposition(&format!(r#"attachment; filename="{filename}";"#));
                    req.response.set_body_blob(&bytes, &content_type);
                }
                Err(e) => {
                    return Err(HandlerError::internal(format!(
                        "cannot open blob {document}: {e}"
                    )));
                }
            }
            Ok(())
        },
    );

    server.start()?;
    Ok(())
}
