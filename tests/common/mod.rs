//! Shared fixtures: a small AdventureWorks-shaped source database

#![allow(dead_code)]

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sales_star_etl::{Column, DataType, Dataset, MemoryStore, StoreRole, Value};

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn ts(y: i32, m: u32, d: u32) -> Value {
    Value::Timestamp(
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap(),
    )
}

fn table(name: &str, columns: &[(&str, DataType)], rows: Vec<Vec<Value>>) -> Dataset {
    Dataset::with_rows(
        name,
        columns
            .iter()
            .map(|(n, t)| Column::new(*n, *t))
            .collect(),
        rows,
    )
    .unwrap()
}

/// One order line row: (order, line, qty, product, price, discount)
pub fn order_line(order: i64, line: i64, qty: i64, product: i64, price: &str, disc: &str) -> Vec<Value> {
    vec![
        Value::Int(order),
        Value::Int(line),
        Value::Int(qty),
        Value::Int(product),
        Value::Decimal(dec(price)),
        Value::Decimal(dec(disc)),
    ]
}

pub fn order_detail(rows: Vec<Vec<Value>>) -> Dataset {
    table(
        "Sales.SalesOrderDetail",
        &[
            ("SalesOrderID", DataType::Integer),
            ("SalesOrderDetailID", DataType::Integer),
            ("OrderQty", DataType::Integer),
            ("ProductID", DataType::Integer),
            ("UnitPrice", DataType::Numeric),
            ("UnitPriceDiscount", DataType::Numeric),
        ],
        rows,
    )
}

pub fn order_header() -> Dataset {
    table(
        "Sales.SalesOrderHeader",
        &[
            ("SalesOrderID", DataType::Integer),
            ("OrderDate", DataType::Timestamp),
            ("CustomerID", DataType::Integer),
            ("TotalDue", DataType::Numeric),
        ],
        vec![
            vec![Value::Int(1), ts(2023, 5, 1), Value::Int(7), Value::Decimal(dec("30.00"))],
            vec![Value::Int(2), ts(2023, 6, 15), Value::Int(7), Value::Decimal(dec("27.00"))],
        ],
    )
}

pub fn product() -> Dataset {
    table(
        "Production.Product",
        &[
            ("ProductID", DataType::Integer),
            ("Name", DataType::Text),
            ("Color", DataType::Text),
            ("Size", DataType::Text),
            ("Weight", DataType::Numeric),
            ("ProductSubcategoryID", DataType::Integer),
        ],
        vec![
            vec![
                Value::Int(42),
                Value::from("Road-150"),
                Value::from("Red"),
                Value::from("44"),
                Value::Decimal(dec("6.80")),
                Value::Int(14),
            ],
            vec![
                Value::Int(43),
                Value::from("Chain"),
                Value::from("Silver"),
                Value::Null,
                Value::Null,
                Value::Null,
            ],
        ],
    )
}

pub fn customer() -> Dataset {
    table(
        "Sales.Customer",
        &[
            ("CustomerID", DataType::Integer),
            ("PersonID", DataType::Integer),
            ("StoreID", DataType::Integer),
        ],
        vec![
            vec![Value::Int(7), Value::Int(100), Value::Null],
            vec![Value::Int(8), Value::Null, Value::Int(934)],
        ],
    )
}

pub fn person() -> Dataset {
    table(
        "Person.Person",
        &[
            ("BusinessEntityID", DataType::Integer),
            ("Title", DataType::Text),
            ("FirstName", DataType::Text),
            ("LastName", DataType::Text),
            ("AdditionalContactInfo", DataType::Text),
        ],
        vec![vec![
            Value::Int(100),
            Value::from("Ms."),
            Value::from("Ann"),
            Value::from("Lee"),
            Value::Null,
        ]],
    )
}

pub fn product_category() -> Dataset {
    product_category_rows(&[(1, "Bikes"), (2, "Components")])
}

/// Category rows: (productcategoryid, name)
pub fn product_category_rows(rows: &[(i64, &str)]) -> Dataset {
    table(
        "Production.ProductCategory",
        &[("ProductCategoryID", DataType::Integer), ("Name", DataType::Text)],
        rows.iter()
            .map(|(id, name)| vec![Value::Int(*id), Value::from(*name)])
            .collect(),
    )
}

pub fn product_subcategory() -> Dataset {
    product_subcategory_rows(&[(14, 1, "Road Bikes"), (8, 2, "Chains")])
}

/// Subcategory rows: (productsubcategoryid, productcategoryid, name)
pub fn product_subcategory_rows(rows: &[(i64, i64, &str)]) -> Dataset {
    table(
        "Production.ProductSubcategory",
        &[
            ("ProductSubcategoryID", DataType::Integer),
            ("ProductCategoryID", DataType::Integer),
            ("Name", DataType::Text),
        ],
        rows.iter()
            .map(|(sub, cat, name)| vec![Value::Int(*sub), Value::Int(*cat), Value::from(*name)])
            .collect(),
    )
}

/// Source store with every table the pipeline reads
///
/// Order 1: customer 7 buys 2 x product 42 at 15.00 on 2023-05-01.
/// Order 2: customer 7 buys 3 x product 43 at 10.00 less 1.00 on 2023-06-15.
pub fn seeded_source() -> MemoryStore {
    seeded_source_with(order_detail(vec![
        order_line(1, 1, 2, 42, "15.00", "0.00"),
        order_line(2, 2, 3, 43, "10.00", "1.00"),
    ]))
}

pub fn seeded_source_with(detail: Dataset) -> MemoryStore {
    let store = MemoryStore::new(StoreRole::Source);
    for ds in [
        detail,
        order_header(),
        product(),
        customer(),
        person(),
        product_category(),
        product_subcategory(),
    ] {
        store.insert_table(&ds).unwrap();
    }
    store
}
